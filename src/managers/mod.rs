pub mod remote_fs;
