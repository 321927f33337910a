//! Device-Control Binding (spec.md §4.8): the platform calls that configure
//! the kernel NBD device. Abstracted behind a trait so the host-client flow
//! (§4.7) can be exercised in tests against a recording mock instead of a
//! real `/dev/nbdN` device.

use std::os::unix::io::RawFd;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DevCtlError {
    #[error("ioctl failed: {0}")]
    Ioctl(#[from] std::io::Error),
}

/// The kernel NBD device-control operations, in the order §4.7 requires
/// them to be issued for a successful attach: `clear_sock, set_blksize,
/// set_size_blocks, set_timeout, set_flags, set_sock, do_it`, followed on
/// every exit path by `disconnect, clear_sock`.
pub trait DeviceControl {
    fn clear_sock(&self) -> Result<(), DevCtlError>;
    fn set_blksize(&self, blksize: u32) -> Result<(), DevCtlError>;
    fn set_size_blocks(&self, blocks: u64) -> Result<(), DevCtlError>;
    fn set_timeout(&self, timeout: u32) -> Result<(), DevCtlError>;
    fn set_flags(&self, flags: u32) -> Result<(), DevCtlError>;
    fn set_sock(&self, sock: RawFd) -> Result<(), DevCtlError>;
    /// Blocks until the kernel driver detaches the socket (signal,
    /// disconnect, or fatal error).
    fn do_it(&self) -> Result<(), DevCtlError>;
    fn disconnect(&self) -> Result<(), DevCtlError>;
}

/// Flag mask used at host setup: `HAS_FLAGS` (bit 0) | `SEND_FLUSH` (bit 2).
pub const SETUP_FLAGS: u32 = (1 << 0) | (1 << 2);

#[cfg(unix)]
pub mod ioctl {
    //! Real ioctl-backed [`DeviceControl`], numbers matching the kernel's
    //! `nbd.h` (`NBD_IOCTL` type `0xab`).
    use super::{DevCtlError, DeviceControl};
    use std::fs::File;
    use std::os::unix::io::{AsRawFd, RawFd};

    mod raw {
        use nix::{ioctl_none_bad, ioctl_write_int_bad, request_code_none};
        const NBD_IOCTL: u8 = 0xab;
        ioctl_write_int_bad!(set_sock, request_code_none!(NBD_IOCTL, 0));
        ioctl_write_int_bad!(set_blksize, request_code_none!(NBD_IOCTL, 1));
        ioctl_none_bad!(do_it, request_code_none!(NBD_IOCTL, 3));
        ioctl_none_bad!(clear_sock, request_code_none!(NBD_IOCTL, 4));
        ioctl_write_int_bad!(set_size_blocks, request_code_none!(NBD_IOCTL, 7));
        ioctl_none_bad!(disconnect, request_code_none!(NBD_IOCTL, 8));
        ioctl_write_int_bad!(set_timeout, request_code_none!(NBD_IOCTL, 9));
        ioctl_write_int_bad!(set_flags, request_code_none!(NBD_IOCTL, 10));
    }

    fn from_errno(e: nix::Error) -> DevCtlError {
        DevCtlError::Ioctl(std::io::Error::from(e))
    }

    /// A `/dev/nbdN` device file, opened read-write by the caller.
    pub struct IoctlDeviceControl {
        file: File,
    }

    impl IoctlDeviceControl {
        #[must_use]
        pub fn new(file: File) -> Self {
            Self { file }
        }

        #[must_use]
        pub fn file(&self) -> &File {
            &self.file
        }
    }

    impl DeviceControl for IoctlDeviceControl {
        fn clear_sock(&self) -> Result<(), DevCtlError> {
            unsafe { raw::clear_sock(self.file.as_raw_fd()) }.map_err(from_errno)?;
            Ok(())
        }

        fn set_blksize(&self, blksize: u32) -> Result<(), DevCtlError> {
            unsafe { raw::set_blksize(self.file.as_raw_fd(), blksize as i32) }.map_err(from_errno)?;
            Ok(())
        }

        fn set_size_blocks(&self, blocks: u64) -> Result<(), DevCtlError> {
            unsafe { raw::set_size_blocks(self.file.as_raw_fd(), blocks as i32) }.map_err(from_errno)?;
            Ok(())
        }

        fn set_timeout(&self, timeout: u32) -> Result<(), DevCtlError> {
            unsafe { raw::set_timeout(self.file.as_raw_fd(), timeout as i32) }.map_err(from_errno)?;
            Ok(())
        }

        fn set_flags(&self, flags: u32) -> Result<(), DevCtlError> {
            unsafe { raw::set_flags(self.file.as_raw_fd(), flags as i32) }.map_err(from_errno)?;
            Ok(())
        }

        fn set_sock(&self, sock: RawFd) -> Result<(), DevCtlError> {
            unsafe { raw::set_sock(self.file.as_raw_fd(), sock) }.map_err(from_errno)?;
            Ok(())
        }

        fn do_it(&self) -> Result<(), DevCtlError> {
            unsafe { raw::do_it(self.file.as_raw_fd()) }.map_err(from_errno)?;
            Ok(())
        }

        fn disconnect(&self) -> Result<(), DevCtlError> {
            unsafe { raw::disconnect(self.file.as_raw_fd()) }.map_err(from_errno)?;
            Ok(())
        }
    }
}

/// A call recorded by [`RecordingDeviceControl`], for asserting the exact
/// device-control ordering property in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    ClearSock,
    SetBlksize(u32),
    SetSizeBlocks(u64),
    SetTimeout(u32),
    SetFlags(u32),
    SetSock(RawFd),
    DoIt,
    Disconnect,
}

/// An in-memory [`DeviceControl`] that records every call instead of
/// touching a real device, so the host-client attach/teardown flow can be
/// exercised against a loopback socket pair without `/dev/nbdN`.
#[derive(Default)]
pub struct RecordingDeviceControl {
    calls: std::sync::Mutex<Vec<RecordedCall>>,
}

impl RecordingDeviceControl {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(std::sync::PoisonError::into_inner).clone()
    }

    fn record(&self, call: RecordedCall) {
        self.calls
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(call);
    }
}

impl DeviceControl for RecordingDeviceControl {
    fn clear_sock(&self) -> Result<(), DevCtlError> {
        self.record(RecordedCall::ClearSock);
        Ok(())
    }

    fn set_blksize(&self, blksize: u32) -> Result<(), DevCtlError> {
        self.record(RecordedCall::SetBlksize(blksize));
        Ok(())
    }

    fn set_size_blocks(&self, blocks: u64) -> Result<(), DevCtlError> {
        self.record(RecordedCall::SetSizeBlocks(blocks));
        Ok(())
    }

    fn set_timeout(&self, timeout: u32) -> Result<(), DevCtlError> {
        self.record(RecordedCall::SetTimeout(timeout));
        Ok(())
    }

    fn set_flags(&self, flags: u32) -> Result<(), DevCtlError> {
        self.record(RecordedCall::SetFlags(flags));
        Ok(())
    }

    fn set_sock(&self, sock: RawFd) -> Result<(), DevCtlError> {
        self.record(RecordedCall::SetSock(sock));
        Ok(())
    }

    fn do_it(&self) -> Result<(), DevCtlError> {
        self.record(RecordedCall::DoIt);
        Ok(())
    }

    fn disconnect(&self) -> Result<(), DevCtlError> {
        self.record(RecordedCall::Disconnect);
        Ok(())
    }
}

/// Runs the full setup → `do_it` → teardown sequence against any
/// [`DeviceControl`], the shape both the real binding and tests share.
///
/// # Errors
/// Propagates the first device-control failure; teardown is still attempted
/// on the way out regardless of how `do_it` returned.
pub fn attach_and_serve(
    dev: &impl DeviceControl,
    blksize: u32,
    blocks: u64,
    timeout: u32,
    sock: RawFd,
) -> Result<(), DevCtlError> {
    dev.clear_sock()?;
    dev.set_blksize(blksize)?;
    dev.set_size_blocks(blocks)?;
    dev.set_timeout(timeout)?;
    dev.set_flags(SETUP_FLAGS)?;
    dev.set_sock(sock)?;
    let result = dev.do_it();
    let _ = dev.disconnect();
    let _ = dev.clear_sock();
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_and_serve_issues_the_spec_required_sequence() {
        let dev = RecordingDeviceControl::new();
        attach_and_serve(&dev, 512, 2048, 10, 7).unwrap();
        assert_eq!(
            dev.calls(),
            vec![
                RecordedCall::ClearSock,
                RecordedCall::SetBlksize(512),
                RecordedCall::SetSizeBlocks(2048),
                RecordedCall::SetTimeout(10),
                RecordedCall::SetFlags(SETUP_FLAGS),
                RecordedCall::SetSock(7),
                RecordedCall::DoIt,
                RecordedCall::Disconnect,
                RecordedCall::ClearSock,
            ]
        );
    }

    #[test]
    fn teardown_still_runs_when_do_it_fails() {
        struct FailingDoIt(RecordingDeviceControl);
        impl DeviceControl for FailingDoIt {
            fn clear_sock(&self) -> Result<(), DevCtlError> {
                self.0.clear_sock()
            }
            fn set_blksize(&self, b: u32) -> Result<(), DevCtlError> {
                self.0.set_blksize(b)
            }
            fn set_size_blocks(&self, b: u64) -> Result<(), DevCtlError> {
                self.0.set_size_blocks(b)
            }
            fn set_timeout(&self, t: u32) -> Result<(), DevCtlError> {
                self.0.set_timeout(t)
            }
            fn set_flags(&self, f: u32) -> Result<(), DevCtlError> {
                self.0.set_flags(f)
            }
            fn set_sock(&self, s: RawFd) -> Result<(), DevCtlError> {
                self.0.set_sock(s)
            }
            fn do_it(&self) -> Result<(), DevCtlError> {
                self.0.record(RecordedCall::DoIt);
                Err(DevCtlError::Ioctl(std::io::Error::other("kernel said no")))
            }
            fn disconnect(&self) -> Result<(), DevCtlError> {
                self.0.disconnect()
            }
        }

        let dev = FailingDoIt(RecordingDeviceControl::new());
        let result = attach_and_serve(&dev, 512, 1, 10, 3);
        assert!(result.is_err());
        assert!(dev.0.calls().contains(&RecordedCall::Disconnect));
        assert_eq!(
            dev.0.calls().iter().filter(|c| **c == RecordedCall::ClearSock).count(),
            2,
            "clear_sock must run both before setup and during teardown"
        );
    }
}
