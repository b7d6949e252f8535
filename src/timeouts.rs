pub mod ms {
    pub const POLL_INTERVAL: u64 = 100;
    pub const NETWORK_IDLE: u64 = 500;
    pub const DOM_STABLE: u64 = 500;
    pub const READY_STATE_POLL: u64 = 100;
}

pub mod secs {
    pub const STABILITY_MAX: u64 = 30;
    pub const BODY_FETCH: u64 = 10;
    pub const DRAIN_GRACE: u64 = 5;
    pub const CUSTOM_CHECK: u64 = 5;
    pub const DEFAULT_TIMEOUT: u64 = 60;
}

pub mod limits {
    pub const BODY_FETCH_WORKERS: usize = 16;
    pub const CUSTOM_CHECK_EVALS: usize = 4;
}
