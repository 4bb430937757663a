mod inetd;

pub use inetd::*;
