//! Listeners are notified about changes of the cluster reported by the control connection.

use arc_swap::ArcSwap;
use std::net::IpAddr;
use std::sync::Arc;

use super::TopologySnapshot;

/// Receives the changes the cluster announces through server events.
///
/// Every callback runs after the topology directory and the routing policy
/// were updated, so `topology` already reflects the change. Callbacks are
/// invoked synchronously from the cluster's background worker, in the order
/// the listeners were added; a slow listener delays the handling of later events.
#[allow(unused_variables)]
pub trait EventListener: Send + Sync {
    /// A node joined the cluster.
    fn on_join_cluster(&self, topology: &TopologySnapshot, endpoint: IpAddr) {}

    /// A node left the cluster.
    fn on_leave_cluster(&self, topology: &TopologySnapshot, endpoint: IpAddr) {}

    /// A node moved to other tokens.
    fn on_move(&self, topology: &TopologySnapshot, endpoint: IpAddr) {}

    /// A node became reachable.
    fn on_up(&self, topology: &TopologySnapshot, endpoint: IpAddr) {}

    /// A node became unreachable.
    fn on_down(&self, topology: &TopologySnapshot, endpoint: IpAddr) {}

    /// A keyspace was created.
    fn on_create_keyspace(&self, topology: &TopologySnapshot, keyspace: &str) {}

    /// The replication of a keyspace changed.
    fn on_update_keyspace(&self, topology: &TopologySnapshot, keyspace: &str) {}

    /// A keyspace was dropped together with its tables.
    fn on_drop_keyspace(&self, topology: &TopologySnapshot, keyspace: &str) {}

    /// A table was created.
    fn on_create_table(&self, topology: &TopologySnapshot, keyspace: &str, table: &str) {}

    /// A table was altered.
    fn on_update_table(&self, topology: &TopologySnapshot, keyspace: &str, table: &str) {}

    /// A table was dropped.
    fn on_drop_table(&self, topology: &TopologySnapshot, keyspace: &str, table: &str) {}
}

/// Append-only list of listeners; readers iterate a snapshot.
#[derive(Default)]
pub(crate) struct ListenerList {
    listeners: ArcSwap<Vec<Arc<dyn EventListener>>>,
}

impl ListenerList {
    pub(crate) fn add(&self, listener: Arc<dyn EventListener>) {
        self.listeners.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&listener));
            next
        });
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.load().len()
    }

    /// Calls `notify` on every listener in the order they were added.
    pub(crate) fn notify(&self, notify: impl Fn(&dyn EventListener)) {
        for listener in self.listeners.load().iter() {
            notify(listener.as_ref());
        }
    }
}

impl std::fmt::Debug for ListenerList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerList")
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::utils::test_utils::{ip, setup_tracing};
    use std::sync::Mutex;

    /// Records every callback as a short line, e.g. `up 127.0.0.2`.
    #[derive(Default)]
    pub(crate) struct RecordingListener {
        name: &'static str,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl RecordingListener {
        /// Prefixes every recorded call with `name`, writing to a log shared with others.
        pub(crate) fn sharing(name: &'static str, calls: Arc<Mutex<Vec<String>>>) -> Self {
            RecordingListener { name, calls }
        }

        pub(crate) fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            let call = match self.name {
                "" => call,
                name => format!("{name}: {call}"),
            };
            self.calls.lock().unwrap().push(call);
        }
    }

    impl EventListener for RecordingListener {
        fn on_join_cluster(&self, _: &TopologySnapshot, endpoint: IpAddr) {
            self.record(format!("join {endpoint}"));
        }
        fn on_leave_cluster(&self, _: &TopologySnapshot, endpoint: IpAddr) {
            self.record(format!("leave {endpoint}"));
        }
        fn on_move(&self, _: &TopologySnapshot, endpoint: IpAddr) {
            self.record(format!("move {endpoint}"));
        }
        fn on_up(&self, _: &TopologySnapshot, endpoint: IpAddr) {
            self.record(format!("up {endpoint}"));
        }
        fn on_down(&self, _: &TopologySnapshot, endpoint: IpAddr) {
            self.record(format!("down {endpoint}"));
        }
        fn on_create_keyspace(&self, _: &TopologySnapshot, keyspace: &str) {
            self.record(format!("create keyspace {keyspace}"));
        }
        fn on_update_keyspace(&self, _: &TopologySnapshot, keyspace: &str) {
            self.record(format!("update keyspace {keyspace}"));
        }
        fn on_drop_keyspace(&self, _: &TopologySnapshot, keyspace: &str) {
            self.record(format!("drop keyspace {keyspace}"));
        }
        fn on_create_table(&self, _: &TopologySnapshot, keyspace: &str, table: &str) {
            self.record(format!("create table {keyspace}.{table}"));
        }
        fn on_update_table(&self, _: &TopologySnapshot, keyspace: &str, table: &str) {
            self.record(format!("update table {keyspace}.{table}"));
        }
        fn on_drop_table(&self, _: &TopologySnapshot, keyspace: &str, table: &str) {
            self.record(format!("drop table {keyspace}.{table}"));
        }
    }

    #[test]
    fn listeners_are_called_in_registration_order() {
        setup_tracing();
        let list = ListenerList::default();
        let log = Arc::new(Mutex::new(Vec::new()));
        let first = Arc::new(RecordingListener::sharing("first", log.clone()));
        let second = Arc::new(RecordingListener::sharing("second", log.clone()));

        list.add(first.clone());
        list.add(second);
        assert_eq!(list.len(), 2);

        let topology = TopologySnapshot::default();
        list.notify(|listener| listener.on_up(&topology, ip(1)));
        list.notify(|listener| listener.on_create_table(&topology, "ks", "t"));
        assert_eq!(
            first.calls(),
            vec![
                "first: up 127.0.0.1",
                "second: up 127.0.0.1",
                "first: create table ks.t",
                "second: create table ks.t",
            ]
        );
    }

    #[test]
    fn default_callbacks_do_nothing() {
        struct Quiet;
        impl EventListener for Quiet {}

        let list = ListenerList::default();
        list.add(Arc::new(Quiet));
        let topology = TopologySnapshot::default();
        list.notify(|listener| {
            listener.on_join_cluster(&topology, ip(1));
            listener.on_drop_table(&topology, "ks", "t");
        });
    }
}
