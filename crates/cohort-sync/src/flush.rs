//! Flush participation.

use cohort_core::Flush;

/// A protocol taking part in view-change barriers.
///
/// The flush coordinator calls `start_flush`, then (when processing is
/// required) `process_flush`, then `end_flush`. A participant signals
/// readiness for each phase through [`Flush::grant`] and may withdraw it with
/// [`Flush::revoke`].
pub trait FlushParticipant {
    /// Name under which grants are recorded.
    fn participant_name(&self) -> &'static str;

    fn is_flush_processing_required(&self) -> bool;

    fn start_flush(&mut self, flush: Flush);

    fn process_flush(&mut self);

    fn end_flush(&mut self);
}
