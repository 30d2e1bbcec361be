//! Cancellation manager: maps permit id to cancellation handle and job id
//! (spec.md §4.11).

use dashmap::DashMap;
use roboppi_common::{CancelHandle, CancelReason, JobId, PermitId};

struct Controller {
    cancel: CancelHandle,
    job_id: Option<JobId>,
}

pub struct CancellationManager {
    controllers: DashMap<PermitId, Controller>,
}

impl Default for CancellationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationManager {
    pub fn new() -> Self {
        Self {
            controllers: DashMap::new(),
        }
    }

    pub fn create_controller(&self, permit_id: PermitId, job_id: Option<JobId>) -> CancelHandle {
        let cancel = CancelHandle::new();
        self.controllers.insert(
            permit_id,
            Controller {
                cancel: cancel.clone(),
                job_id,
            },
        );
        cancel
    }

    pub fn cancel(&self, permit_id: PermitId, reason: CancelReason) {
        if let Some(entry) = self.controllers.get(&permit_id) {
            entry.cancel.fire(reason);
        }
    }

    /// Fans out to every permit registered under `job_id`.
    pub fn cancel_by_job_id(&self, job_id: JobId, reason: CancelReason) {
        for entry in self.controllers.iter() {
            if entry.value().job_id == Some(job_id) {
                entry.value().cancel.fire(reason.clone());
            }
        }
    }

    pub fn is_aborted(&self, permit_id: PermitId) -> bool {
        self.controllers
            .get(&permit_id)
            .map(|c| c.cancel.is_aborted())
            .unwrap_or(false)
    }

    pub fn remove_controller(&self, permit_id: PermitId) {
        self.controllers.remove(&permit_id);
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;

    #[test]
    fn cancel_by_permit_id_fires_handle() {
        let mgr = CancellationManager::new();
        let permit_id = PermitId::new();
        let handle = mgr.create_controller(permit_id, None);
        mgr.cancel(permit_id, CancelReason::User);
        assert!(handle.is_aborted());
        assert!(mgr.is_aborted(permit_id));
    }

    #[test]
    fn cancel_by_job_id_fans_out() {
        let mgr = CancellationManager::new();
        let job_id = JobId::new();
        let p1 = PermitId::new();
        let p2 = PermitId::new();
        let h1 = mgr.create_controller(p1, Some(job_id));
        let h2 = mgr.create_controller(p2, Some(job_id));
        let other = mgr.create_controller(PermitId::new(), None);

        mgr.cancel_by_job_id(job_id, CancelReason::Deadline);

        assert!(h1.is_aborted());
        assert!(h2.is_aborted());
        assert!(!other.is_aborted());
    }

    #[test]
    fn remove_controller_drops_tracking() {
        let mgr = CancellationManager::new();
        let permit_id = PermitId::new();
        mgr.create_controller(permit_id, None);
        mgr.remove_controller(permit_id);
        assert!(!mgr.is_aborted(permit_id));
    }
}
