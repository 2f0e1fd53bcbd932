use crate::dispatch::DispatchShared;
use std::sync::Arc;

/// Reference-counted liveness marker.
///
/// While any token is alive the dispatch loop reports pending work, so a
/// blocking [crate::Runtime::dispatch_events] keeps draining instead of
/// returning early. Tokens are held by queued dispatch jobs, unsettled
/// promises, open coordinators and open data channels; dropping the token
/// releases the count and wakes blocked dispatchers.
pub(crate) struct EventToken {
    shared: Arc<DispatchShared>,
}

impl EventToken {
    pub(crate) fn new(shared: Arc<DispatchShared>) -> Self {
        shared.token_acquired();
        EventToken { shared }
    }
}

impl Clone for EventToken {
    fn clone(&self) -> Self {
        EventToken::new(self.shared.clone())
    }
}

impl Drop for EventToken {
    fn drop(&mut self) {
        self.shared.token_released();
    }
}

impl std::fmt::Debug for EventToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventToken")
            .field("pending", &self.shared.pending())
            .finish()
    }
}
