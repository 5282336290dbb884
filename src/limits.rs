//! Hard bounds on user-supplied input.

pub const MAX_VENUES: usize = 10_000;
pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EVENT_NAME_LEN: usize = 256;
pub const MAX_DESCRIPTION_LEN: usize = 4096;
pub const MAX_URL_LEN: usize = 2048;
pub const MAX_USER_ID_LEN: usize = 128;
pub const MAX_EMAIL_LEN: usize = 320;
