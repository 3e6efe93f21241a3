pub mod check;
pub mod init;
pub mod next;
pub mod run;
pub mod validate;
