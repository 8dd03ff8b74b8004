use super::model::TrackerUpdate;

pub type UpdateCallback = Box<dyn FnMut(&TrackerUpdate)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Default)]
pub(super) struct UpdateSubscribers {
    next_id: u64,
    callbacks: Vec<(SubscriptionId, UpdateCallback)>,
}

impl UpdateSubscribers {
    pub(super) fn subscribe(&mut self, callback: UpdateCallback) -> SubscriptionId {
        self.next_id = self.next_id.saturating_add(1);
        let subscription_id = SubscriptionId(self.next_id);
        self.callbacks.push((subscription_id, callback));
        subscription_id
    }

    pub(super) fn unsubscribe(&mut self, subscription_id: SubscriptionId) -> bool {
        let before = self.callbacks.len();
        self.callbacks.retain(|(id, _)| *id != subscription_id);
        self.callbacks.len() != before
    }

    pub(super) fn emit(&mut self, update: &TrackerUpdate) {
        for (_, callback) in self.callbacks.iter_mut() {
            callback(update);
        }
    }

    pub(super) fn clear(&mut self) {
        self.callbacks.clear();
    }
}
