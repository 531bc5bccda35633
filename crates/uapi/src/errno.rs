//! 错误码（Linux 兼容，取负值返回给用户态）

pub const EPERM: isize = 1;
pub const ENOENT: isize = 2;
pub const EIO: isize = 5;
pub const EBADF: isize = 9;
pub const ENOMEM: isize = 12;
pub const EACCES: isize = 13;
pub const EFAULT: isize = 14;
pub const EEXIST: isize = 17;
pub const EINVAL: isize = 22;
pub const ENOSPC: isize = 28;
