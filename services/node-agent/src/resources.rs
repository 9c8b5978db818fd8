//! Host measurement: CPU, memory, root filesystem, kernel and interface
//! addresses.

use std::net::Ipv4Addr;
use std::path::Path;

/// Snapshot of host resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemResources {
    pub cpu_cores: u32,
    pub total_memory_bytes: u64,
    /// Size of the root filesystem.
    pub total_disk_bytes: u64,
}

impl SystemResources {
    pub fn measure() -> Self {
        Self {
            cpu_cores: host_cpu_count(),
            total_memory_bytes: host_memory_bytes(),
            total_disk_bytes: filesystem_bytes(Path::new("/")),
        }
    }
}

/// Number of logical CPUs online on the host.
pub fn host_cpu_count() -> u32 {
    #[cfg(unix)]
    {
        let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if count > 0 {
            return u32::try_from(count).unwrap_or(u32::MAX);
        }
    }

    std::thread::available_parallelism()
        .map(|p| u32::try_from(p.get()).unwrap_or(u32::MAX))
        .unwrap_or(1)
}

/// Physical memory installed on the host.
pub fn host_memory_bytes() -> u64 {
    #[cfg(unix)]
    {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
        if page_size > 0 && pages > 0 {
            return (page_size as u64).saturating_mul(pages as u64);
        }
    }

    // Fall back to a conservative figure when the host cannot be queried.
    16 * 1024 * 1024 * 1024
}

/// Total size of the filesystem holding `path`, or 0 when it cannot be read.
pub fn filesystem_bytes(path: &Path) -> u64 {
    #[cfg(unix)]
    {
        use std::ffi::CString;
        use std::mem::MaybeUninit;
        use std::os::unix::ffi::OsStrExt;

        if let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) {
            let mut stat = MaybeUninit::<libc::statvfs>::uninit();
            if unsafe { libc::statvfs(c_path.as_ptr(), stat.as_mut_ptr()) } == 0 {
                let stat = unsafe { stat.assume_init() };
                return (stat.f_blocks as u64).saturating_mul(stat.f_frsize as u64);
            }
        }
    }
    #[cfg(not(unix))]
    let _ = path;

    0
}

/// Kernel name and release of the host, as reported by `uname`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelInfo {
    pub name: String,
    pub release: String,
}

pub fn kernel_info() -> Option<KernelInfo> {
    #[cfg(unix)]
    {
        let mut uts = std::mem::MaybeUninit::<libc::utsname>::uninit();
        if unsafe { libc::uname(uts.as_mut_ptr()) } == 0 {
            let uts = unsafe { uts.assume_init() };
            return Some(KernelInfo {
                name: c_field(&uts.sysname),
                release: c_field(&uts.release),
            });
        }
    }
    None
}

#[cfg(unix)]
fn c_field(raw: &[libc::c_char]) -> String {
    let bytes: Vec<u8> = raw
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

/// IPv4 address assigned to the named interface. The last one wins when
/// several are assigned.
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub fn interface_ipv4(name: &str) -> Option<Ipv4Addr> {
    use std::ffi::CStr;

    let mut head: *mut libc::ifaddrs = std::ptr::null_mut();
    if unsafe { libc::getifaddrs(&mut head) } != 0 {
        return None;
    }

    let mut found = None;
    let mut cursor = head;
    while !cursor.is_null() {
        let entry = unsafe { &*cursor };
        cursor = entry.ifa_next;

        if entry.ifa_addr.is_null() || entry.ifa_name.is_null() {
            continue;
        }
        let entry_name = unsafe { CStr::from_ptr(entry.ifa_name) };
        if entry_name.to_bytes() != name.as_bytes() {
            continue;
        }
        if i32::from(unsafe { (*entry.ifa_addr).sa_family }) != libc::AF_INET {
            continue;
        }
        let sin = unsafe { &*(entry.ifa_addr as *const libc::sockaddr_in) };
        found = Some(Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)));
    }

    unsafe { libc::freeifaddrs(head) };
    found
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
pub fn interface_ipv4(_name: &str) -> Option<Ipv4Addr> {
    None
}
