//! The device contract and the vendor backend table.

use crate::error::DeviceResult;
use crate::ioctl::Ioctl;

/// The operation contract shared by the client proxy and the server instance.
///
/// Implementations are independent: the wire protocol is the real contract,
/// not a shared base.
pub trait VideoDevice: Send + Sync {
    fn open(&self, name: &str, flags: i32) -> bool;

    fn close(&self) -> bool;

    /// Executes `cmd`, updating it in place with the driver's results.
    fn ioctl(&self, cmd: &mut Ioctl) -> DeviceResult<()>;

    /// Returns whether an event is pending.
    fn poll(&self, poll_device: bool) -> DeviceResult<bool>;

    fn set_device_poll_interrupt(&self) -> DeviceResult<()>;

    fn clear_device_poll_interrupt(&self) -> DeviceResult<()>;

    /// Maps the buffer identified by `offset` and returns its local address.
    fn mmap(
        &self,
        addr: usize,
        length: usize,
        prot: i32,
        flags: i32,
        offset: u32,
    ) -> DeviceResult<usize>;

    fn munmap(&self, addr: usize, length: usize) -> DeviceResult<()>;

    fn set_parameter(&self, key: &str, value: &str) -> DeviceResult<()>;
}

/// Vendor status codes; any non-zero failure is propagated unchanged.
pub type BackendResult<T> = Result<T, i32>;

/// The vendor hardware operation table.
///
/// # Safety
///
/// Addresses returned by [`DeviceBackend::mmap`] must stay valid for reads
/// and writes of `length` bytes until the matching `munmap` (or `close`).
/// For user-pointer buffers the backend may only touch the memory described
/// by the plane's pointer and length, and only during the `ioctl` call that
/// carries it.
pub unsafe trait DeviceBackend: Send {
    fn open(&mut self, name: &str, flags: i32) -> BackendResult<()>;

    fn close(&mut self) -> BackendResult<()>;

    fn ioctl(&mut self, cmd: &mut Ioctl) -> BackendResult<()>;

    fn poll(&mut self, poll_device: bool) -> BackendResult<bool>;

    fn set_device_poll_interrupt(&mut self) -> BackendResult<()>;

    fn clear_device_poll_interrupt(&mut self) -> BackendResult<()>;

    fn mmap(&mut self, length: usize, prot: i32, flags: i32, offset: u32) -> BackendResult<usize>;

    fn munmap(&mut self, addr: usize, length: usize) -> BackendResult<()>;

    fn set_parameter(&mut self, key: &str, value: &str) -> BackendResult<()>;
}

pub mod prot {
    pub const READ: i32 = 0x1;
    pub const WRITE: i32 = 0x2;
}

pub mod map_flags {
    pub const SHARED: i32 = 0x01;
}
