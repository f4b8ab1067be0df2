//! Client permission bits.
//!
//! Every session carries a permission mask seeded from the configured
//! defaults; the command dispatcher checks a verb's required bits against
//! it before executing.

pub const PERMISSION_NONE: u32 = 0;
pub const PERMISSION_READ: u32 = 1 << 0;
pub const PERMISSION_ADD: u32 = 1 << 1;
pub const PERMISSION_CONTROL: u32 = 1 << 2;
pub const PERMISSION_ADMIN: u32 = 1 << 3;

/// Everything. Used when no restrictions are configured.
pub const PERMISSION_ALL: u32 =
    PERMISSION_READ | PERMISSION_ADD | PERMISSION_CONTROL | PERMISSION_ADMIN;

/// Look up a single permission bit by its configuration name.
pub fn parse_name(name: &str) -> Option<u32> {
    match name {
        "read" => Some(PERMISSION_READ),
        "add" => Some(PERMISSION_ADD),
        "control" => Some(PERMISSION_CONTROL),
        "admin" => Some(PERMISSION_ADMIN),
        _ => None,
    }
}

/// Build a permission mask from configured names, returning the first
/// unrecognized name on failure.
pub fn mask_from_names<S: AsRef<str>>(names: &[S]) -> Result<u32, String> {
    let mut mask = PERMISSION_NONE;
    for name in names {
        match parse_name(name.as_ref()) {
            Some(bit) => mask |= bit,
            None => return Err(name.as_ref().to_string()),
        }
    }
    Ok(mask)
}
