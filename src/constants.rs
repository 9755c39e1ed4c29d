pub mod network {
    pub const SSH_DEFAULT_PORT: u16 = 22;
    pub const TIMEOUT_SSH_READY_MS: u64 = 10_000;
    pub const TIMEOUT_SSH_OPERATION_MS: u64 = 45_000;
    pub const KEEPALIVE_INTERVAL_MS: u64 = 30_000;
}

pub mod pool {
    pub const MAX_IDLE_MS: u64 = 300_000;
    pub const MAX_CONNECTIONS: usize = 10;
    pub const SWEEP_INTERVAL_MS: u64 = 30_000;
}

pub mod limits {
    pub const MAX_PORT: u16 = 65_535;
    pub const MIN_PORT: u16 = 1;
    pub const MAX_MODE: u32 = 0o7777;
}

pub mod permissions {
    pub const DEFAULT_FILE_MODE: u32 = 0o644;
    pub const DEFAULT_DIR_MODE: u32 = 0o755;
}
