use std::collections::{HashMap, HashSet};

use futures::{pin_mut, Stream, StreamExt};
use k8s_openapi::api::core::v1::Node;
use kube::runtime::watcher;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::event::{Event, NodeSnapshot};

/// Turns the node watch into Add/Del events.
///
/// Remembers the last snapshot delivered for every node so updates can be
/// diffed, unchanged nodes stay silent and deletes carry what was last
/// routed.
#[derive(Debug, Default)]
pub struct EventSource {
    known: HashMap<String, NodeSnapshot>,
}

impl EventSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn handle(&mut self, event: watcher::Event<Node>) -> Vec<Event> {
        match event {
            watcher::Event::Applied(node) => self.applied(&node),
            watcher::Event::Deleted(node) => self.deleted(&node),
            watcher::Event::Restarted(nodes) => self.restarted(&nodes),
        }
    }

    fn applied(&mut self, node: &Node) -> Vec<Event> {
        let Some(name) = node.metadata.name.as_deref() else {
            return vec![];
        };
        let new = NodeSnapshot::from_node(node);

        if let (Some(old), Some(new)) = (self.known.get(name), new.as_ref()) {
            if old == new {
                debug!(node = name, "unchanged");
                return vec![];
            }
        }

        let old = match &new {
            Some(new) => self.known.insert(name.to_owned(), new.clone()),
            None => self.known.remove(name),
        };
        if old.is_none() && new.is_none() {
            debug!(node = name, "not ready");
        }

        old.map(Event::del)
            .into_iter()
            .chain(new.map(Event::add))
            .collect()
    }

    fn deleted(&mut self, node: &Node) -> Vec<Event> {
        node.metadata
            .name
            .as_deref()
            .and_then(|name| self.known.remove(name))
            .map(Event::del)
            .into_iter()
            .collect()
    }

    fn restarted(&mut self, nodes: &[Node]) -> Vec<Event> {
        let listed = nodes
            .iter()
            .filter_map(|node| node.metadata.name.clone())
            .collect::<HashSet<_>>();

        let gone = self
            .known
            .keys()
            .filter(|name| !listed.contains(*name))
            .cloned()
            .collect::<Vec<_>>();

        let mut events = gone
            .iter()
            .filter_map(|name| self.known.remove(name))
            .map(Event::del)
            .collect::<Vec<_>>();

        for node in nodes {
            events.extend(self.applied(node));
        }

        info!(nodes = nodes.len(), events = events.len(), "resynced node list");
        events
    }

    /// Feeds events from `stream` into `tx` until either side is done.
    pub async fn forward<S>(mut self, stream: S, tx: mpsc::Sender<Event>)
    where
        S: Stream<Item = Result<watcher::Event<Node>, watcher::Error>>,
    {
        pin_mut!(stream);

        while let Some(item) = stream.next().await {
            let event = match item {
                Ok(event) => event,
                Err(err) => {
                    warn!(%err, "node watch failed");
                    continue;
                }
            };

            for event in self.handle(event) {
                if tx.send(event).await.is_err() {
                    debug!("event receiver gone");
                    return;
                }
            }
        }

        info!("node watch ended");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{tests::node, EventKind};

    const READY: Option<&str> = Some(r#"{"publicIPv4":"192.168.1.11"}"#);

    fn kinds(events: &[Event]) -> Vec<(EventKind, &str)> {
        events
            .iter()
            .map(|event| (event.kind, event.node.name.as_str()))
            .collect()
    }

    #[test]
    fn first_sighting_adds() {
        let mut source = EventSource::new();
        let events = source.handle(watcher::Event::Applied(node("a", &["10.244.1.0/24"], READY)));
        assert_eq!(kinds(&events), vec![(EventKind::Add, "a")]);
    }

    #[test]
    fn unready_node_is_silent_until_ready() {
        let mut source = EventSource::new();
        assert!(source
            .handle(watcher::Event::Applied(node("a", &["10.244.1.0/24"], None)))
            .is_empty());

        let events = source.handle(watcher::Event::Applied(node("a", &["10.244.1.0/24"], READY)));
        assert_eq!(kinds(&events), vec![(EventKind::Add, "a")]);
    }

    #[test]
    fn equal_update_is_suppressed() {
        let mut source = EventSource::new();
        source.handle(watcher::Event::Applied(node("a", &["10.244.1.0/24"], READY)));

        let mut relabeled = node("a", &["10.244.1.0/24"], READY);
        relabeled.metadata.resource_version = Some("42".into());
        assert!(source.handle(watcher::Event::Applied(relabeled)).is_empty());
    }

    #[test]
    fn changed_update_replaces() {
        let mut source = EventSource::new();
        source.handle(watcher::Event::Applied(node("a", &["10.244.1.0/24"], READY)));

        let moved = node("a", &["10.244.1.0/24"], Some(r#"{"publicIPv4":"192.168.1.99"}"#));
        let events = source.handle(watcher::Event::Applied(moved));

        assert_eq!(kinds(&events), vec![(EventKind::Del, "a"), (EventKind::Add, "a")]);
        assert_eq!(
            events[0].node.annotations.public_ipv4,
            Some("192.168.1.11".parse().unwrap())
        );
        assert_eq!(
            events[1].node.annotations.public_ipv4,
            Some("192.168.1.99".parse().unwrap())
        );
    }

    #[test]
    fn update_to_unready_deletes() {
        let mut source = EventSource::new();
        source.handle(watcher::Event::Applied(node("a", &["10.244.1.0/24"], READY)));

        let events = source.handle(watcher::Event::Applied(node("a", &["10.244.1.0/24"], None)));
        assert_eq!(kinds(&events), vec![(EventKind::Del, "a")]);
    }

    #[test]
    fn delete_carries_last_snapshot() {
        let mut source = EventSource::new();
        source.handle(watcher::Event::Applied(node("a", &["10.244.1.0/24"], READY)));

        // the deleted object may have lost its annotations already
        let events = source.handle(watcher::Event::Deleted(node("a", &[], None)));
        assert_eq!(kinds(&events), vec![(EventKind::Del, "a")]);
        assert_eq!(
            events[0].node.annotations.public_ipv4,
            Some("192.168.1.11".parse().unwrap())
        );

        assert!(source.handle(watcher::Event::Deleted(node("a", &[], None))).is_empty());
    }

    #[test]
    fn restart_diffs_against_known_nodes() {
        let mut source = EventSource::new();
        source.handle(watcher::Event::Restarted(vec![
            node("a", &["10.244.1.0/24"], READY),
            node("b", &["10.244.2.0/24"], READY),
        ]));

        let events = source.handle(watcher::Event::Restarted(vec![
            node("b", &["10.244.2.0/24"], READY),
            node("c", &["10.244.3.0/24"], READY),
        ]));

        assert_eq!(kinds(&events), vec![(EventKind::Del, "a"), (EventKind::Add, "c")]);
    }

    #[tokio::test]
    async fn forward_preserves_order() {
        let stream = futures::stream::iter(vec![
            Ok::<_, watcher::Error>(watcher::Event::Applied(node("a", &["10.244.1.0/24"], READY))),
            Ok(watcher::Event::Applied(node("b", &["10.244.2.0/24"], READY))),
            Ok(watcher::Event::Deleted(node("a", &[], None))),
        ]);
        let (tx, mut rx) = mpsc::channel(1);

        let producer = tokio::spawn(EventSource::new().forward(stream, tx));

        let mut received = vec![];
        while let Some(event) = rx.recv().await {
            received.push((event.kind, event.node.name));
        }
        producer.await.unwrap();

        assert_eq!(
            received,
            vec![
                (EventKind::Add, "a".to_owned()),
                (EventKind::Add, "b".to_owned()),
                (EventKind::Del, "a".to_owned()),
            ]
        );
    }
}
