//! Mount options recognised by the adapter.

use std::collections::HashSet;
use std::time::Duration;

use crate::ll::Errno;

/// Options accepted when mounting a volume. Each cache or metadata toggle
/// is independently observable through the adapter's behaviour.
#[derive(Debug, Eq, PartialEq, Hash, Clone)]
pub enum MountOption {
    /// Check permissions in the adapter instead of forwarding ACCESS
    DefaultPermissions,
    /// Allow every access up front, forwarding later as needed
    DeferPermissions,
    /// Bypass the page cache for this mount; implies no readahead and no
    /// name cache
    DirectIO,
    /// Allow all users to access files on this filesystem. By default
    /// access is restricted to the user who mounted it
    AllowOther,
    /// Allow the root user to access this filesystem, in addition to the
    /// user who mounted it
    AllowRoot,
    /// Keep cached pages across OPEN iff mtime and size are unchanged
    AutoCache,
    /// Skip the hidden-rename mechanism; always UNLINK immediately
    HardRemove,
    /// Hide .DS_Store and ._* names from directory listings
    NoAppleDouble,
    /// Deny com.apple.* extended attribute names
    NoAppleXattr,
    /// Don't force synchronous writes through on flush
    NoSyncWrites,
    /// Never cache file pages
    NoUbc,
    /// Never cache name lookups
    NoVnCache,
    /// Never cache attributes
    NoAttrCache,
    /// Cache negative name lookups too
    NegativeVnCache,
    /// Expose backup and creation times
    XTimes,
    /// Report sparse allocation in attributes
    Sparse,
    /// Honor extended security attributes
    ExtendedSecurity,
    /// Mark the session dead when no reply arrives within the bound
    DaemonTimeout(Duration),
    /// I/O chunking granularity
    BlockSize(u32),
    /// Volume name presented to the host
    VolName(String),
}

impl MountOption {
    /// Parses one comma-list element of a mount string.
    pub fn from_str(s: &str) -> Result<MountOption, Errno> {
        Ok(match s {
            "default_permissions" => MountOption::DefaultPermissions,
            "defer_permissions" => MountOption::DeferPermissions,
            "direct_io" => MountOption::DirectIO,
            "allow_other" => MountOption::AllowOther,
            "allow_root" => MountOption::AllowRoot,
            "auto_cache" => MountOption::AutoCache,
            "hard_remove" => MountOption::HardRemove,
            "no_apple_double" => MountOption::NoAppleDouble,
            "no_apple_xattr" => MountOption::NoAppleXattr,
            "no_syncwrites" => MountOption::NoSyncWrites,
            "no_ubc" => MountOption::NoUbc,
            "no_vncache" => MountOption::NoVnCache,
            "no_attrcache" => MountOption::NoAttrCache,
            "negative_vncache" => MountOption::NegativeVnCache,
            "xtimes" => MountOption::XTimes,
            "sparse" => MountOption::Sparse,
            "extended_security" => MountOption::ExtendedSecurity,
            _ => {
                if let Some(x) = s.strip_prefix("daemon_timeout=") {
                    let secs: u64 = x.parse().map_err(|_| Errno::EINVAL)?;
                    MountOption::DaemonTimeout(Duration::from_secs(secs))
                } else if let Some(x) = s.strip_prefix("blocksize=") {
                    MountOption::BlockSize(x.parse().map_err(|_| Errno::EINVAL)?)
                } else if let Some(x) = s.strip_prefix("volname=") {
                    MountOption::VolName(x.to_string())
                } else {
                    return Err(Errno::EINVAL);
                }
            }
        })
    }
}

impl std::fmt::Display for MountOption {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MountOption::DefaultPermissions => f.write_str("default_permissions"),
            MountOption::DeferPermissions => f.write_str("defer_permissions"),
            MountOption::DirectIO => f.write_str("direct_io"),
            MountOption::AllowOther => f.write_str("allow_other"),
            MountOption::AllowRoot => f.write_str("allow_root"),
            MountOption::AutoCache => f.write_str("auto_cache"),
            MountOption::HardRemove => f.write_str("hard_remove"),
            MountOption::NoAppleDouble => f.write_str("no_apple_double"),
            MountOption::NoAppleXattr => f.write_str("no_apple_xattr"),
            MountOption::NoSyncWrites => f.write_str("no_syncwrites"),
            MountOption::NoUbc => f.write_str("no_ubc"),
            MountOption::NoVnCache => f.write_str("no_vncache"),
            MountOption::NoAttrCache => f.write_str("no_attrcache"),
            MountOption::NegativeVnCache => f.write_str("negative_vncache"),
            MountOption::XTimes => f.write_str("xtimes"),
            MountOption::Sparse => f.write_str("sparse"),
            MountOption::ExtendedSecurity => f.write_str("extended_security"),
            MountOption::DaemonTimeout(t) => write!(f, "daemon_timeout={}", t.as_secs()),
            MountOption::BlockSize(b) => write!(f, "blocksize={b}"),
            MountOption::VolName(n) => write!(f, "volname={n}"),
        }
    }
}

pub(crate) fn check_option_conflicts(options: &[MountOption]) -> Result<(), Errno> {
    let options_set: HashSet<MountOption> = options.iter().cloned().collect();
    let conflicting: HashSet<MountOption> =
        options.iter().flat_map(conflicts_with).collect();
    if conflicting.intersection(&options_set).next().is_some() {
        return Err(Errno::EINVAL);
    }
    Ok(())
}

fn conflicts_with(option: &MountOption) -> Vec<MountOption> {
    match option {
        MountOption::DefaultPermissions => vec![MountOption::DeferPermissions],
        MountOption::DeferPermissions => vec![MountOption::DefaultPermissions],
        MountOption::AllowOther => vec![MountOption::AllowRoot],
        MountOption::AllowRoot => vec![MountOption::AllowOther],
        MountOption::DirectIO => vec![MountOption::AutoCache],
        MountOption::AutoCache => vec![MountOption::DirectIO],
        MountOption::NoVnCache => vec![MountOption::NegativeVnCache],
        MountOption::NegativeVnCache => vec![MountOption::NoVnCache],
        _ => vec![],
    }
}

/// The option list digested into the flags the adapter consults per call.
#[derive(Debug, Clone)]
pub(crate) struct MountConfig {
    pub(crate) default_permissions: bool,
    pub(crate) defer_permissions: bool,
    pub(crate) direct_io: bool,
    pub(crate) allow_other: bool,
    pub(crate) allow_root: bool,
    pub(crate) auto_cache: bool,
    pub(crate) hard_remove: bool,
    pub(crate) no_apple_double: bool,
    pub(crate) no_apple_xattr: bool,
    pub(crate) no_syncwrites: bool,
    pub(crate) no_ubc: bool,
    pub(crate) no_vncache: bool,
    pub(crate) no_attrcache: bool,
    pub(crate) negative_vncache: bool,
    pub(crate) xtimes: bool,
    pub(crate) sparse: bool,
    pub(crate) extended_security: bool,
    pub(crate) daemon_timeout: Option<Duration>,
    pub(crate) blocksize: u32,
    pub(crate) volname: Option<String>,
}

impl MountConfig {
    pub(crate) fn parse(options: &[MountOption]) -> Result<MountConfig, Errno> {
        check_option_conflicts(options)?;
        let mut config = MountConfig {
            default_permissions: false,
            defer_permissions: false,
            direct_io: false,
            allow_other: false,
            allow_root: false,
            auto_cache: false,
            hard_remove: false,
            no_apple_double: false,
            no_apple_xattr: false,
            no_syncwrites: false,
            no_ubc: false,
            no_vncache: false,
            no_attrcache: false,
            negative_vncache: false,
            xtimes: false,
            sparse: false,
            extended_security: false,
            daemon_timeout: None,
            blocksize: 4096,
            volname: None,
        };
        for option in options {
            match option {
                MountOption::DefaultPermissions => config.default_permissions = true,
                MountOption::DeferPermissions => config.defer_permissions = true,
                MountOption::DirectIO => {
                    // direct_io shuts off readahead and the name cache too.
                    config.direct_io = true;
                    config.no_ubc = true;
                    config.no_vncache = true;
                }
                MountOption::AllowOther => config.allow_other = true,
                MountOption::AllowRoot => config.allow_root = true,
                MountOption::AutoCache => config.auto_cache = true,
                MountOption::HardRemove => config.hard_remove = true,
                MountOption::NoAppleDouble => config.no_apple_double = true,
                MountOption::NoAppleXattr => config.no_apple_xattr = true,
                MountOption::NoSyncWrites => config.no_syncwrites = true,
                MountOption::NoUbc => config.no_ubc = true,
                MountOption::NoVnCache => config.no_vncache = true,
                MountOption::NoAttrCache => config.no_attrcache = true,
                MountOption::NegativeVnCache => config.negative_vncache = true,
                MountOption::XTimes => config.xtimes = true,
                MountOption::Sparse => config.sparse = true,
                MountOption::ExtendedSecurity => config.extended_security = true,
                MountOption::DaemonTimeout(t) => config.daemon_timeout = Some(*t),
                MountOption::BlockSize(b) => {
                    if *b == 0 || !b.is_power_of_two() {
                        return Err(Errno::EINVAL);
                    }
                    config.blocksize = *b;
                }
                MountOption::VolName(n) => config.volname = Some(n.clone()),
            }
        }
        Ok(config)
    }
}
