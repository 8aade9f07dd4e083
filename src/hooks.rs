//! Host callbacks invoked at fixed points of every object scan.
//!
//! Call order per object: `pre_cache` (before the cache lookup),
//! `pre_scan` (before any handler runs), `post_scan` (after the object's
//! scan finished, with its result). Cache hits skip `pre_scan` and
//! `post_scan`.
//!
//! A `Whitelist` verdict ends the object as clean. From `post_scan` it also
//! retracts every match recorded while the object was in scope. A
//! `Blacklist` verdict records `Detected.By.Callback`.

use crate::filetype::FileType;
use crate::outcome::Status;

/// Match name recorded when a hook blacklists an object.
pub const CALLBACK_DETECTION: &str = "Detected.By.Callback";

/// Host decision returned by a hook.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum HookVerdict {
    /// Keep going.
    #[default]
    Proceed,
    /// Treat the object as clean and stop scanning it.
    Whitelist,
    /// Treat the object as infected.
    Blacklist,
}

/// What a hook gets to see about the object in scope.
#[derive(Clone, Copy, Debug)]
pub struct ObjectInfo<'a> {
    pub file_type: FileType,
    pub len: u64,
    pub depth: u32,
    pub name: Option<&'a str>,
    pub parent_type: FileType,
    /// At most the first `DETECT_HEAD_LEN` bytes.
    pub head: &'a [u8],
}

/// Host callback set. Every method defaults to `Proceed`.
pub trait ScanHooks: Send + Sync {
    fn pre_cache(&self, _obj: &ObjectInfo<'_>) -> HookVerdict {
        HookVerdict::Proceed
    }

    fn pre_scan(&self, _obj: &ObjectInfo<'_>) -> HookVerdict {
        HookVerdict::Proceed
    }

    /// `result` is `Virus` when the aggregation policy halted inside this
    /// object; `matched` is true when any match was recorded in its scope.
    fn post_scan(&self, _obj: &ObjectInfo<'_>, _result: Status, _matched: bool) -> HookVerdict {
        HookVerdict::Proceed
    }
}

/// Hooks that never intervene.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoHooks;

impl ScanHooks for NoHooks {}
