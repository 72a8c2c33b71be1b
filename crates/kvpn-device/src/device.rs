//! The real, platform-backed virtual interface.
//!
//! Reads and writes go straight through raw `libc` calls on the fd rather
//! than through `std::io::Read`/`Write` — `tun::platform::Device`'s
//! blanket impls need `&mut self`, which a device shared behind `&self`
//! for concurrent reads and writes can't offer.

use crate::error::{DeviceError, DeviceResult};
use std::os::unix::io::{AsRawFd, RawFd};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::unix::AsyncFd;
use tokio::sync::Notify;
use tracing::{debug, warn};

const DEFAULT_IFACE_NAME: &str = "wg1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Uninit,
    Open,
    Closed,
}

/// Capability surface the handler/agent layers depend on. A `cfg(test)`
/// mock implements this too, so relay/session code can be exercised
/// without a real kernel TUN driver.
#[allow(async_fn_in_trait)]
pub trait TunDevice: Send + Sync {
    async fn read_packet(&self, buf: &mut [u8]) -> DeviceResult<usize>;
    async fn write_packet(&self, buf: &[u8]) -> DeviceResult<usize>;
    fn add_subnet(&self, cidr: &str) -> DeviceResult<()>;
    fn remove_subnet(&self, cidr: &str) -> DeviceResult<()>;
    fn set_dns(&self, ip: &str, search_domains: &[String]) -> DeviceResult<()>;
    fn set_mtu(&self, mtu: u16) -> DeviceResult<()>;
    async fn close(&self) -> DeviceResult<()>;
    fn state(&self) -> DeviceState;
}

/// Address family of a previously configured DNS server, tracked so a
/// family switch flushes the old one first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DnsFamily {
    V4,
    V6,
}

fn family_of(ip: &str) -> Option<DnsFamily> {
    if ip.parse::<std::net::Ipv4Addr>().is_ok() {
        Some(DnsFamily::V4)
    } else if ip.parse::<std::net::Ipv6Addr>().is_ok() {
        Some(DnsFamily::V6)
    } else {
        None
    }
}

/// Bare fd handle so `AsyncFd` has something `AsRawFd` to register; the
/// backing `tun::platform::Device` owns and closes the real fd on drop.
struct RawFdHandle(RawFd);

impl AsRawFd for RawFdHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

/// The live virtual interface.
///
/// `_tun` is kept only to hold the fd open and to run teardown through the
/// crate's own `Drop`; all reads/writes go through `fd` directly.
/// `closing`/`closed_notify` implement the unblock-on-close contract
/// without the source's throwaway-datagram trick — `AsyncFd::readable`
/// is already a cancellable future, so racing it against a `Notify` in
/// `select!` is the OS-native-equivalent primitive the design notes call
/// for when a portable one exists.
pub struct Device {
    _tun: tun::platform::Device,
    fd: AsyncFd<RawFdHandle>,
    name: String,
    closed: AtomicBool,
    closed_notify: Arc<Notify>,
    dns_family: std::sync::Mutex<Option<DnsFamily>>,
}

impl Device {
    /// Create and name the interface. If any step after the fd is opened
    /// fails, the fd is dropped (closing it) before the error is returned.
    pub fn open(name: Option<&str>) -> DeviceResult<Self> {
        let iface_name = name.unwrap_or(DEFAULT_IFACE_NAME).to_string();
        let mut config = tun::Configuration::default();
        config.name(&iface_name).up();

        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            tun::create(&config)
        }));

        let tun_device = match result {
            Ok(Ok(device)) => device,
            Ok(Err(e)) => return Err(DeviceError::Open(e.to_string())),
            Err(_) => {
                return Err(DeviceError::Open(
                    "platform driver panicked during interface construction".into(),
                ))
            }
        };

        let raw_fd = tun_device.as_raw_fd();
        if let Err(e) = set_non_blocking(raw_fd) {
            // tun_device drops here, releasing the fd.
            return Err(DeviceError::Open(format!("set non-blocking: {e}")));
        }

        let fd = match AsyncFd::new(RawFdHandle(raw_fd)) {
            Ok(fd) => fd,
            Err(e) => return Err(DeviceError::Open(format!("register with reactor: {e}"))),
        };

        debug!(name = %iface_name, "tun device opened");
        Ok(Self {
            _tun: tun_device,
            fd,
            name: iface_name,
            closed: AtomicBool::new(false),
            closed_notify: Arc::new(Notify::new()),
            dns_family: std::sync::Mutex::new(None),
        })
    }

    fn check_open(&self) -> DeviceResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DeviceError::Closed);
        }
        Ok(())
    }

    fn run_ip(&self, args: &[&str]) -> DeviceResult<()> {
        let output = Command::new("ip")
            .args(args)
            .output()
            .map_err(|e| DeviceError::Configure(format!("exec ip {args:?}: {e}")))?;
        if !output.status.success() {
            return Err(DeviceError::Configure(format!(
                "ip {args:?} failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

fn set_non_blocking(fd: RawFd) -> std::io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    let ret = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if ret < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[allow(async_fn_in_trait)]
impl TunDevice for Device {
    async fn read_packet(&self, buf: &mut [u8]) -> DeviceResult<usize> {
        self.check_open()?;
        loop {
            let mut guard = tokio::select! {
                biased;
                _ = self.closed_notify.notified() => return Err(DeviceError::Closed),
                r = self.fd.readable() => r.map_err(|e| DeviceError::Read(e.to_string()))?,
            };
            let io_result = guard.try_io(|inner| {
                let fd = inner.get_ref().as_raw_fd();
                let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match io_result {
                Ok(result) => return result.map_err(|e| DeviceError::Read(e.to_string())),
                Err(_would_block) => continue,
            }
        }
    }

    async fn write_packet(&self, buf: &[u8]) -> DeviceResult<usize> {
        self.check_open()?;
        loop {
            let mut guard = self
                .fd
                .writable()
                .await
                .map_err(|e| DeviceError::Write(e.to_string()))?;
            let io_result = guard.try_io(|inner| {
                let fd = inner.get_ref().as_raw_fd();
                let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
                if n < 0 {
                    Err(std::io::Error::last_os_error())
                } else {
                    Ok(n as usize)
                }
            });
            match io_result {
                Ok(result) => return result.map_err(|e| DeviceError::Write(e.to_string())),
                Err(_would_block) => continue,
            }
        }
    }

    fn add_subnet(&self, cidr: &str) -> DeviceResult<()> {
        self.check_open()?;
        self.run_ip(&["addr", "add", cidr, "dev", &self.name])
    }

    fn remove_subnet(&self, cidr: &str) -> DeviceResult<()> {
        self.check_open()?;
        self.run_ip(&["addr", "del", cidr, "dev", &self.name])
    }

    /// Sets DNS for the interface via `resolvectl`, flushing the prior
    /// address family first if it differs from the one being set, then
    /// asking the host to flush its resolver cache (best-effort; a
    /// failure here is logged, not propagated. On a host
    /// with no `resolvectl` this is treated as the no-interface-DNS-concept
    /// case and reports success.
    fn set_dns(&self, ip: &str, search_domains: &[String]) -> DeviceResult<()> {
        self.check_open()?;
        let new_family = family_of(ip)
            .ok_or_else(|| DeviceError::Configure(format!("not an IP address: {ip}")))?;

        let mut current = self.dns_family.lock().expect("dns_family mutex poisoned");
        if let Some(prev) = *current {
            if prev != new_family {
                let _ = Command::new("resolvectl")
                    .args(["revert", &self.name])
                    .output();
            }
        }

        match Command::new("resolvectl")
            .args(["dns", &self.name, ip])
            .output()
        {
            Ok(output) if output.status.success() => {
                *current = Some(new_family);
            }
            Ok(output) => {
                debug!(
                    stderr = %String::from_utf8_lossy(&output.stderr),
                    "resolvectl dns unavailable, treating as no-op platform"
                );
            }
            Err(e) => {
                debug!(error = %e, "resolvectl not found, treating as no-op platform");
            }
        }

        if !search_domains.is_empty() {
            let mut args = vec!["domain".to_string(), self.name.clone()];
            args.extend(search_domains.iter().cloned());
            let _ = Command::new("resolvectl").args(&args).output();
        }

        let _ = Command::new("resolvectl").args(["flush-caches"]).output();
        Ok(())
    }

    fn set_mtu(&self, _mtu: u16) -> DeviceResult<()> {
        self.check_open()?;
        Err(DeviceError::Unsupported(
            "mtu cannot be changed after interface creation on this backend".into(),
        ))
    }

    /// Close-unblock dance: flip the closed flag, wake any in-flight
    /// `read_packet` via `Notify` (raced inside `select!` there), then tear
    /// down the interface. Idempotent.
    async fn close(&self) -> DeviceResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.closed_notify.notify_waiters();

        let name = self.name.clone();
        let worker = tokio::task::spawn_blocking(move || {
            let _ = Command::new("ip").args(["link", "del", &name]).output();
        });
        if let Err(e) = worker.await {
            warn!(error = %e, "close worker panicked");
        }
        Ok(())
    }

    fn state(&self) -> DeviceState {
        if self.closed.load(Ordering::SeqCst) {
            DeviceState::Closed
        } else {
            DeviceState::Open
        }
    }
}
