use std::sync::Arc;

pub trait ActionSender: Send + Sync {
    type SendableAction;

    fn send(&self, action: Self::SendableAction);
}

pub struct AnyActionSender<Action: Send + 'static> {
    value: Arc<dyn ActionSender<SendableAction = Action>>,
}

impl<Action: Send> AnyActionSender<Action> {
    pub fn new(value: impl ActionSender<SendableAction = Action> + 'static) -> Self {
        Self {
            value: Arc::new(value),
        }
    }
}

impl<Action: Send> Clone for AnyActionSender<Action> {
    fn clone(&self) -> Self {
        Self {
            value: self.value.clone(),
        }
    }
}

impl<Action: Send> ActionSender for AnyActionSender<Action> {
    type SendableAction = Action;

    fn send(&self, action: Action) {
        self.value.send(action)
    }
}
