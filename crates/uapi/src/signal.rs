//! 信号编号（仅列出内存子系统会投递的信号）

pub const SIGSEGV: u32 = 11;
