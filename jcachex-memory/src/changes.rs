//  Copyright 2025 JCacheX Project Authors
//
//  Licensed under the Apache License, Version 2.0 (the "License");
//  you may not use this file except in compliance with the License.
//  You may obtain a copy of the License at
//
//  http://www.apache.org/licenses/LICENSE-2.0
//
//  Unless required by applicable law or agreed to in writing, software
//  distributed under the License is distributed on an "AS IS" BASIS,
//  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
//  See the License for the specific language governing permissions and
//  limitations under the License.

use parking_lot::RwLock;

/// A local mutation, as observed by replication subscribers.
///
/// The stream carries writes that originated on this node; changes applied
/// through [`crate::Cache::apply_external_change`] are not republished, so
/// subscribers never see their own traffic echoed back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryChange<K, V> {
    Put { key: K, value: V },
    Remove { key: K },
    Clear,
}

pub(crate) struct ChangeHub<K, V> {
    subscribers: RwLock<Vec<flume::Sender<EntryChange<K, V>>>>,
}

impl<K, V> Default for ChangeHub<K, V> {
    fn default() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }
}

impl<K, V> ChangeHub<K, V>
where
    K: Clone,
    V: Clone,
{
    pub fn subscribe(&self) -> flume::Receiver<EntryChange<K, V>> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.write().push(tx);
        rx
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.read().is_empty()
    }

    /// Fan the change out to live subscribers, dropping disconnected ones.
    pub fn publish(&self, change: EntryChange<K, V>) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(change.clone()).is_ok());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_to_subscribers() {
        let hub = ChangeHub::<u64, String>::default();
        let rx1 = hub.subscribe();
        let rx2 = hub.subscribe();

        hub.publish(EntryChange::Put {
            key: 1,
            value: "a".to_string(),
        });
        hub.publish(EntryChange::Remove { key: 1 });

        for rx in [rx1, rx2] {
            assert_eq!(
                rx.try_recv().unwrap(),
                EntryChange::Put {
                    key: 1,
                    value: "a".to_string()
                }
            );
            assert_eq!(rx.try_recv().unwrap(), EntryChange::Remove { key: 1 });
        }
    }

    #[test]
    fn test_disconnected_subscriber_is_dropped() {
        let hub = ChangeHub::<u64, u64>::default();
        let rx = hub.subscribe();
        drop(rx);

        hub.publish(EntryChange::Clear);
        assert!(hub.is_empty());
    }
}
