use tokio::sync::watch;

#[derive(Debug)]
pub struct StateSlot<T> {
    tx: watch::Sender<T>,
}

impl<T> StateSlot<T> {
    pub fn new(initial: T) -> Self {
        Self {
            tx: watch::Sender::new(initial),
        }
    }

    pub fn set(&self, value: T) {
        self.tx.send_replace(value);
    }

    pub fn replace(&self, value: T) -> T {
        self.tx.send_replace(value)
    }

    pub fn update<F>(&self, f: F) -> bool
    where
        F: FnOnce(&mut T) -> bool,
    {
        self.tx.send_if_modified(f)
    }

    pub fn borrow(&self) -> watch::Ref<'_, T> {
        self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.tx.subscribe()
    }
}

impl<T: Clone> StateSlot<T> {
    pub fn get(&self) -> T {
        self.tx.borrow().clone()
    }
}

impl<T: Default> Default for StateSlot<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}
