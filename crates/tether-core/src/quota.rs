use tether_types::{QuotaInfo, QuotaType, UNLIMITED};

#[derive(Debug, Clone, Copy)]
struct Quota {
    limit: u64,
    exceeded: bool,
}

impl Default for Quota {
    fn default() -> Self {
        Self {
            limit: UNLIMITED,
            exceeded: false,
        }
    }
}

/// Limits and usage for one endpoint, one entry per [`QuotaType`].
///
/// An exceeded quota stays exceeded until usage drops strictly below the
/// limit again.
#[derive(Debug, Default)]
pub(crate) struct QuotaSet {
    quotas: [Quota; 3],
    usage: [u64; 3],
}

impl QuotaSet {
    pub(crate) fn set_limit(&mut self, ty: QuotaType, limit: u64) {
        self.quotas[ty.index()].limit = limit;
        self.refresh(ty);
    }

    pub(crate) fn set_usage(&mut self, ty: QuotaType, usage: u64) {
        self.usage[ty.index()] = usage;
        self.refresh(ty);
    }

    pub(crate) fn usage(&self, ty: QuotaType) -> u64 {
        self.usage[ty.index()]
    }

    pub(crate) fn info(&self, ty: QuotaType) -> QuotaInfo {
        QuotaInfo {
            limit: self.quotas[ty.index()].limit,
            usage: self.usage[ty.index()],
        }
    }

    pub(crate) fn exceeded(&self) -> bool {
        self.quotas.iter().any(|quota| quota.exceeded)
    }

    fn refresh(&mut self, ty: QuotaType) {
        let usage = self.usage[ty.index()];
        let quota = &mut self.quotas[ty.index()];
        if usage > quota.limit {
            quota.exceeded = true;
        } else if usage < quota.limit {
            quota.exceeded = false;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_quotas_are_unlimited() {
        let quotas = QuotaSet::default();
        for ty in QuotaType::ALL {
            assert_eq!(quotas.info(ty), QuotaInfo { limit: UNLIMITED, usage: 0 });
        }
        assert!(!quotas.exceeded());
    }

    #[test]
    fn exceeded_clears_only_strictly_below_limit() {
        let mut quotas = QuotaSet::default();
        quotas.set_limit(QuotaType::ReceiveQueueLength, 3);
        quotas.set_usage(QuotaType::ReceiveQueueLength, 3);
        assert!(!quotas.exceeded());
        quotas.set_usage(QuotaType::ReceiveQueueLength, 4);
        assert!(quotas.exceeded());
        quotas.set_usage(QuotaType::ReceiveQueueLength, 3);
        assert!(quotas.exceeded());
        quotas.set_usage(QuotaType::ReceiveQueueLength, 2);
        assert!(!quotas.exceeded());
    }

    #[test]
    fn changing_the_limit_reevaluates() {
        let mut quotas = QuotaSet::default();
        quotas.set_usage(QuotaType::ReceiveQueueMemorySize, 100);
        quotas.set_limit(QuotaType::ReceiveQueueMemorySize, 50);
        assert!(quotas.exceeded());
        quotas.set_limit(QuotaType::ReceiveQueueMemorySize, 100);
        assert!(quotas.exceeded());
        quotas.set_limit(QuotaType::ReceiveQueueMemorySize, UNLIMITED);
        assert!(!quotas.exceeded());
    }

    #[test]
    fn any_exceeded_type_counts() {
        let mut quotas = QuotaSet::default();
        quotas.set_limit(QuotaType::UnreadMessageCount, 1);
        quotas.set_usage(QuotaType::UnreadMessageCount, 2);
        quotas.set_usage(QuotaType::ReceiveQueueLength, 50);
        assert!(quotas.exceeded());
    }
}
