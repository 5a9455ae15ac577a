//! Service base names and method names on the bus.

pub const DEVICE_SERVICE: &str = "VideoDevice";
pub const DIRECTORY_SERVICE: &str = "Directory";

pub mod device_methods {
    pub const OPEN: &str = "open";
    pub const CLOSE: &str = "close";
    pub const IOCTL: &str = "ioctl";
    pub const POLL: &str = "poll";
    pub const SET_POLL_INTERRUPT: &str = "setDevicePollInterrupt";
    pub const CLEAR_POLL_INTERRUPT: &str = "clearDevicePollInterrupt";
    pub const MMAP: &str = "mmap";
    pub const MUNMAP: &str = "munmap";
    pub const SET_PARAMETER: &str = "setParameter";
}

pub mod directory_methods {
    pub const CREATE_NODE: &str = "createNode";
    pub const DESTROY_NODE: &str = "destroyNode";
    pub const IS_LOCAL_NODE: &str = "isLocalNode";
}
