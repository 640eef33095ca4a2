// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! A subscribe-to-change value container.
//!
//! [`Observable`] holds one value and an insertion-ordered observer list.
//! Setting the value notifies every observer synchronously on the calling
//! thread. Subscriptions are identified by opaque tokens so owners can
//! deterministically remove exactly the observer they registered; removing
//! an entry does not reorder the others.

/// Identifies one subscription on one [`Observable`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscriptionToken(u64);

pub struct Observable<T> {
    value: T,
    observers: Vec<(SubscriptionToken, Box<dyn FnMut(&T)>)>,
    next_token: u64,
}

impl<T> Observable<T> {
    pub fn new(value: T) -> Observable<T> {
        Observable {
            value,
            observers: Vec::new(),
            next_token: 0,
        }
    }

    pub fn get(&self) -> &T {
        &self.value
    }

    /// Replaces the value and notifies observers in subscription order.
    pub fn set(&mut self, value: T) {
        self.value = value;
        for (_, observer) in self.observers.iter_mut() {
            observer(&self.value);
        }
    }

    pub fn subscribe(&mut self, observer: impl FnMut(&T) + 'static) -> SubscriptionToken {
        let token = SubscriptionToken(self.next_token);
        self.next_token += 1;
        self.observers.push((token, Box::new(observer)));
        token
    }

    /// Removes a subscription. Returns false if the token was already gone.
    pub fn unsubscribe(&mut self, token: SubscriptionToken) -> bool {
        match self.observers.iter().position(|(t, _)| *t == token) {
            Some(index) => {
                self.observers.remove(index);
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::rc::Rc;

    use super::*;

    #[test]
    fn set_notifies_in_subscription_order() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut observable = Observable::new(0);
        for id in ["a", "b", "c"] {
            let seen = seen.clone();
            observable.subscribe(move |v: &i32| seen.borrow_mut().push((id, *v)));
        }
        observable.set(7);
        assert_eq!(*seen.borrow(), vec![("a", 7), ("b", 7), ("c", 7)]);
    }

    #[test]
    fn get_returns_latest() {
        let mut observable = Observable::new(1);
        observable.set(2);
        assert_eq!(*observable.get(), 2);
    }

    #[test]
    fn unsubscribe_keeps_remaining_order() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let mut observable = Observable::new(0);
        let mut tokens = Vec::new();
        for id in ["a", "b", "c"] {
            let seen = seen.clone();
            tokens.push(observable.subscribe(move |v: &i32| seen.borrow_mut().push((id, *v))));
        }
        assert!(observable.unsubscribe(tokens[1]));
        assert!(!observable.unsubscribe(tokens[1]));
        observable.set(3);
        assert_eq!(*seen.borrow(), vec![("a", 3), ("c", 3)]);
    }

    #[test]
    fn tokens_are_not_reused() {
        let mut observable = Observable::new(());
        let first = observable.subscribe(|_| {});
        assert!(observable.unsubscribe(first));
        let second = observable.subscribe(|_| {});
        assert_ne!(first, second);
        assert!(!observable.unsubscribe(first));
    }
}
