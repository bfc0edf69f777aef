//! Reconciliation engine for converge
//!
//! Brings files in line with declarative promises and reports, per path,
//! whether anything had to change. It implements:
//!
//! - **Selection**: per-file predicates combined by a result rule
//! - **Atomic copy**: write to a temporary name, verify, back up, rename
//! - **Link reconciliation**: symbolic, relative, absolute and hard links
//! - **Recursive reconciliation**: guarded tree walks with purge
//! - **Attribute fixing**: permission masks, ownership, setuid audit and
//!   change tracking
//!
//! # Architecture
//!
//! ```text
//!                 dispatcher
//!                     |
//!        +-------+----+-----+--------+
//!        |       |          |        |
//!      leaf    copy       links     walk
//!        |       |          |        |
//!        +-------+-- attrs -+--------+
//!                     |
//!     RunContext (StagedFs, registries, reporter)
//!                     |
//!                converge-fs
//! ```
//!
//! All mutations go through [`converge_fs::StagedFs`], so a run can be
//! staged in a sandbox and inspected before anything touches the live tree.
//!
//! # Example
//!
//! ```no_run
//! use converge_core::{AttributeSpec, FilePromise, Outcome, RunContext, reconcile};
//!
//! let ctx = RunContext::new();
//! let promise = FilePromise::new(
//!     "/etc/motd",
//!     AttributeSpec {
//!         create: true,
//!         ..AttributeSpec::default()
//!     },
//! );
//! assert_ne!(reconcile(&ctx, &promise), Outcome::Failed);
//! ```

pub mod attrs;
pub mod audit;
pub mod changes;
pub mod context;
pub mod copy;
pub mod dispatcher;
pub mod error;
pub mod exec;
pub mod hardlink;
pub mod leaf;
pub mod links;
pub mod logging;
pub mod mode;
pub mod outcome;
pub mod principal;
pub mod purge;
pub mod report;
pub mod select;
pub mod spec;
pub mod transport;
pub mod walk;

pub use context::{DEFAULT_RECURSION_LIMIT, RunConfig, RunContext};
pub use dispatcher::{reconcile, reconcile_all};
pub use error::{Error, Result};
pub use exec::{CommandOutput, CommandRunner, ShellRunner};
pub use mode::ModeMask;
pub use outcome::Outcome;
pub use report::{MemoryReporter, ReportEntry, Reporter, RunSummary, TracingReporter};
pub use select::Selector;
pub use spec::{
    Action, AttributeSpec, BackupMode, ChangesSpec, Comparator, CopyPolicy, DeleteSpec, FilePromise,
    LinkPolicy, LinkType, PermsSpec, PromiseFile, RecursionPolicy, RenameSpec, ReportChanges,
    SelectionCriteria, WhenNoFile,
};
pub use transport::{Connector, LocalTransport, Transport, TransportError};

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn recursion_limit_error_names_path_and_limit() {
        let error = Error::RecursionLimit {
            path: PathBuf::from("/srv/deep"),
            limit: 100,
        };

        let display = error.to_string();
        assert!(display.contains("/srv/deep"), "got: {display}");
        assert!(display.contains("100"), "got: {display}");
        assert!(error.is_fatal());
    }
}
