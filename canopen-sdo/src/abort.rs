//! SDO abort codes (CiA 301) and their human-readable reasons.

/// Reason returned by [`lookup`] for codes missing from the table.
pub const UNKNOWN_ABORT_CODE: &str = "Unknown abort code";

pub const TOGGLE_BIT_NOT_ALTERED: u32 = 0x0503_0000;
pub const PROTOCOL_TIMED_OUT: u32 = 0x0504_0000;
pub const COMMAND_SPECIFIER_INVALID: u32 = 0x0504_0001;
pub const WRITE_READ_ONLY: u32 = 0x0601_0002;
pub const OBJECT_DOES_NOT_EXIST: u32 = 0x0602_0000;
pub const LENGTH_MISMATCH: u32 = 0x0607_0010;
pub const LENGTH_TOO_HIGH: u32 = 0x0607_0012;
pub const SUBINDEX_DOES_NOT_EXIST: u32 = 0x0609_0011;
pub const GENERAL_ERROR: u32 = 0x0800_0000;

/// Every abort code defined by the standard, sorted by code.
pub static ABORT_CODES: &[(u32, &str)] = &[
    (0x0503_0000, "Toggle bit not altered"),
    (0x0504_0000, "SDO protocol timed out"),
    (0x0504_0001, "Command specifier not valid or unknown"),
    (0x0504_0002, "Invalid block size in block mode"),
    (0x0504_0003, "Invalid sequence number in block mode"),
    (0x0504_0004, "CRC error (block mode only)"),
    (0x0504_0005, "Out of memory"),
    (0x0601_0000, "Unsupported access to an object"),
    (0x0601_0001, "Attempt to read a write only object"),
    (0x0601_0002, "Attempt to write a read only object"),
    (0x0602_0000, "Object does not exist"),
    (0x0604_0041, "Object cannot be mapped to the PDO"),
    (0x0604_0042, "Number and length of object to be mapped exceeds PDO length"),
    (0x0604_0043, "General parameter incompatibility reasons"),
    (0x0604_0047, "General internal incompatibility in device"),
    (0x0606_0000, "Access failed due to hardware error"),
    (0x0607_0010, "Data type does not match: length of service parameter does not match"),
    (0x0607_0012, "Data type does not match: length of service parameter too high"),
    (0x0607_0013, "Data type does not match: length of service parameter too short"),
    (0x0609_0011, "Sub index does not exist"),
    (0x0609_0030, "Invalid value for parameter (download only)."),
    (0x0609_0031, "Value range of parameter written too high"),
    (0x0609_0032, "Value range of parameter written too low"),
    (0x0609_0036, "Maximum value is less than minimum value."),
    (0x060A_0023, "Resource not available: SDO connection"),
    (0x0800_0000, "General error"),
    (0x0800_0020, "Data cannot be transferred or stored to application"),
    (0x0800_0021, "Data cannot be transferred or stored to application because of local control"),
    (0x0800_0022, "Data cannot be transferred or stored to application because of present device state"),
    (0x0800_0023, "Object dictionary not present or dynamic generation fails"),
    (0x0800_0024, "No data available"),
];

/// Get the human-readable reason for an abort code.
///
/// Never fails: codes outside the table map to [`UNKNOWN_ABORT_CODE`].
pub fn lookup(code: u32) -> &'static str {
    ABORT_CODES
        .binary_search_by_key(&code, |&(known, _)| known)
        .map(|pos| ABORT_CODES[pos].1)
        .unwrap_or(UNKNOWN_ABORT_CODE)
}
