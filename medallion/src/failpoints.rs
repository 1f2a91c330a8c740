use fail::fail_point;

use crate::bail;
use crate::error::{ErrorKind, EtlResult};

/// Between a durable staging write and the cursor commit of the same batch.
pub const CONSUMER_FLUSH__AFTER_STAGE_WRITE: &str = "consumer_flush.after_stage_write";

/// Before the staging write of a sealed batch.
pub const CONSUMER_FLUSH__BEFORE_STAGE_WRITE: &str = "consumer_flush.before_stage_write";

/// Before a staged object is committed into the raw store.
pub const BRONZE_LOAD__BEFORE_COMMIT: &str = "bronze_load.before_commit";

/// Before a merge window is committed.
pub const MERGE_WINDOW__BEFORE_COMMIT: &str = "merge_window.before_commit";

/// Before a snapshot pass is applied.
pub const SNAPSHOT__BEFORE_APPLY: &str = "snapshot.before_apply";

/// Returns an error if the failpoint `name` is configured to fail.
///
/// The failpoint parameter picks the error kind: `transient` yields an error the retrier retries,
/// anything else a permanent one.
pub fn etl_fail_point(name: &str) -> EtlResult<()> {
    fail_point!(name, |parameter| {
        let error_kind = match parameter.as_deref() {
            #[cfg(feature = "failpoints")]
            Some("transient") => ErrorKind::InjectedTransientFailure,
            #[cfg(feature = "failpoints")]
            _ => ErrorKind::InjectedFailure,
            #[cfg(not(feature = "failpoints"))]
            _ => ErrorKind::Unknown,
        };

        bail!(
            error_kind,
            "An error occurred in a fail point",
            format!("The failpoint '{name}' returned an error")
        );
    });

    Ok(())
}
