// Topic tree: subscriptions and retained messages keyed on `/` segments
//
// Nodes live in an arena and reference each other by index. A node keeps
// the index of its parent so empty nodes can be collected bottom-up after
// an unsubscribe or a retain clear. The root (index 0) is never collected.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::Error;
use crate::message::Message;
use crate::packet::QoS;

/// Anything that can receive messages from the topic tree.
///
/// `publish` is called with the tree lock held and must not block.
pub trait Receiver: Send + Sync {
    fn id(&self) -> &str;
    fn publish(&self, msg: &Message);
}

type NodeId = usize;
const ROOT: NodeId = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubKind {
    Exact,
    MultiLevel,
}

/// Handle returned by [`TopicTree::subscribe`]; pass it back to unsubscribe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    node: NodeId,
    id: u64,
    kind: SubKind,
    pub topic: String,
    pub qos: QoS,
}

struct Sub {
    receiver: Arc<dyn Receiver>,
    qos: QoS,
}

struct Node {
    name: String,
    parent: Option<NodeId>,
    children: HashMap<String, NodeId>,
    wildcard: Option<NodeId>,
    subs: IndexMap<u64, Sub>,
    mlwc_subs: IndexMap<u64, Sub>,
    retain: Option<Message>,
}

impl Node {
    fn new(name: &str, parent: Option<NodeId>) -> Self {
        Self {
            name: name.to_owned(),
            parent,
            children: HashMap::new(),
            wildcard: None,
            subs: IndexMap::new(),
            mlwc_subs: IndexMap::new(),
            retain: None,
        }
    }

    fn is_collectible(&self) -> bool {
        self.children.is_empty()
            && self.wildcard.is_none()
            && self.subs.is_empty()
            && self.mlwc_subs.is_empty()
            && self.retain.is_none()
    }
}

pub struct TopicTree {
    nodes: Vec<Option<Node>>,
    free: Vec<NodeId>,
    next_sub: u64,
}

impl Default for TopicTree {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicTree {
    pub fn new() -> Self {
        Self {
            nodes: vec![Some(Node::new("", None))],
            free: Vec::new(),
            next_sub: 0,
        }
    }

    /// `true` when the root has no children, subscribers or retain slot.
    pub fn is_empty(&self) -> bool {
        self.node(ROOT).is_some_and(Node::is_collectible)
    }

    /// Number of live nodes, root included.
    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    // ── Publish ──────────────────────────────────────────────────────

    /// Deliver `msg` to every matching subscription and return the number
    /// of subscriptions hit. Does not touch retain slots.
    pub fn publish(&self, msg: &Message) -> usize {
        let segments: Vec<&str> = msg.topic.split('/').collect();
        let mut hits = 0;
        self.publish_at(ROOT, &segments, msg, &mut hits);
        hits
    }

    fn publish_at(&self, id: NodeId, segments: &[&str], msg: &Message, hits: &mut usize) {
        let Some(node) = self.node(id) else { return };

        for sub in node.mlwc_subs.values() {
            sub.receiver.publish(&msg.for_delivery(sub.qos));
            *hits += 1;
        }

        match segments.split_first() {
            None => {
                for sub in node.subs.values() {
                    sub.receiver.publish(&msg.for_delivery(sub.qos));
                    *hits += 1;
                }
            }
            Some((head, rest)) => {
                if let Some(&child) = node.children.get(*head) {
                    self.publish_at(child, rest, msg, hits);
                }
                if let Some(wildcard) = node.wildcard {
                    self.publish_at(wildcard, rest, msg, hits);
                }
            }
        }
    }

    /// Store or clear the retained message for `msg.topic`.
    ///
    /// An empty payload clears the slot; otherwise the message replaces it.
    pub fn retain(&mut self, msg: &Message) {
        if msg.payload.is_empty() {
            let mut id = ROOT;
            for segment in msg.topic.split('/') {
                let child = self.node(id).and_then(|n| n.children.get(segment).copied());
                match child {
                    Some(child) => id = child,
                    None => return,
                }
            }
            if let Some(node) = self.node_mut(id) {
                node.retain = None;
            }
            self.collect(id);
        } else {
            let id = msg
                .topic
                .split('/')
                .fold(ROOT, |id, segment| self.literal_child(id, segment));
            if let Some(node) = self.node_mut(id) {
                node.retain = Some(Message {
                    retain: true,
                    ..msg.clone()
                });
            }
        }
    }

    // ── Subscribe ────────────────────────────────────────────────────

    /// Register `receiver` for `filter` and replay matching retained
    /// messages to it.
    pub fn subscribe(
        &mut self,
        filter: &str,
        receiver: Arc<dyn Receiver>,
        qos: QoS,
    ) -> Result<Subscription, Error> {
        validate_topic_filter(filter)?;

        let segments: Vec<&str> = filter.split('/').collect();
        let (kind, path) = match segments.split_last() {
            Some((&"#", path)) => (SubKind::MultiLevel, path),
            _ => (SubKind::Exact, segments.as_slice()),
        };

        let mut id = ROOT;
        for segment in path {
            id = if *segment == "+" {
                self.wildcard_child(id)
            } else {
                self.literal_child(id, segment)
            };
        }

        self.next_sub += 1;
        let sub_id = self.next_sub;
        let sub = Sub {
            receiver: Arc::clone(&receiver),
            qos,
        };
        if let Some(node) = self.node_mut(id) {
            match kind {
                SubKind::Exact => node.subs.insert(sub_id, sub),
                SubKind::MultiLevel => node.mlwc_subs.insert(sub_id, sub),
            };
        }

        let mut retained = Vec::new();
        self.collect_retained(ROOT, &segments, &mut retained);
        for msg in retained {
            receiver.publish(&msg.for_replay(qos));
        }

        Ok(Subscription {
            node: id,
            id: sub_id,
            kind,
            topic: filter.to_owned(),
            qos,
        })
    }

    /// Remove a subscription and collect the nodes it leaves empty.
    /// Returns `false` if the subscription was already gone.
    pub fn unsubscribe(&mut self, sub: &Subscription) -> bool {
        let removed = self.node_mut(sub.node).is_some_and(|node| {
            let list = match sub.kind {
                SubKind::Exact => &mut node.subs,
                SubKind::MultiLevel => &mut node.mlwc_subs,
            };
            list.shift_remove(&sub.id).is_some()
        });
        if removed {
            self.collect(sub.node);
        }
        removed
    }

    // ── Retain replay ────────────────────────────────────────────────

    fn collect_retained<'a>(&'a self, id: NodeId, pattern: &[&str], out: &mut Vec<&'a Message>) {
        let Some(node) = self.node(id) else { return };
        match pattern.split_first() {
            None => out.extend(node.retain.as_ref()),
            Some((&"#", _)) => self.collect_subtree(id, out),
            Some((&"+", rest)) => {
                for &child in node.children.values() {
                    self.collect_retained(child, rest, out);
                }
            }
            Some((literal, rest)) => {
                if let Some(&child) = node.children.get(*literal) {
                    self.collect_retained(child, rest, out);
                }
            }
        }
    }

    fn collect_subtree<'a>(&'a self, id: NodeId, out: &mut Vec<&'a Message>) {
        let Some(node) = self.node(id) else { return };
        out.extend(node.retain.as_ref());
        for &child in node.children.values() {
            self.collect_subtree(child, out);
        }
    }

    // ── Arena ────────────────────────────────────────────────────────

    fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
        self.nodes.get_mut(id).and_then(Option::as_mut)
    }

    fn alloc(&mut self, node: Node) -> NodeId {
        if let Some(id) = self.free.pop() {
            self.nodes[id] = Some(node);
            id
        } else {
            self.nodes.push(Some(node));
            self.nodes.len() - 1
        }
    }

    fn literal_child(&mut self, parent: NodeId, name: &str) -> NodeId {
        if let Some(&id) = self.node(parent).and_then(|n| n.children.get(name)) {
            return id;
        }
        let id = self.alloc(Node::new(name, Some(parent)));
        if let Some(node) = self.node_mut(parent) {
            node.children.insert(name.to_owned(), id);
        }
        id
    }

    fn wildcard_child(&mut self, parent: NodeId) -> NodeId {
        if let Some(id) = self.node(parent).and_then(|n| n.wildcard) {
            return id;
        }
        let id = self.alloc(Node::new("+", Some(parent)));
        if let Some(node) = self.node_mut(parent) {
            node.wildcard = Some(id);
        }
        id
    }

    /// Walk upward from `id`, freeing nodes that hold nothing.
    fn collect(&mut self, mut id: NodeId) {
        while id != ROOT {
            let Some(node) = self.node(id) else { return };
            if !node.is_collectible() {
                return;
            }
            let Some(parent) = node.parent else { return };
            let name = node.name.clone();

            if let Some(p) = self.node_mut(parent) {
                if p.wildcard == Some(id) {
                    p.wildcard = None;
                } else {
                    p.children.remove(&name);
                }
            }
            self.nodes[id] = None;
            self.free.push(id);
            id = parent;
        }
    }
}

// ── Validation ───────────────────────────────────────────────────────

/// Topic names used in PUBLISH: non-empty, no empty segments, no wildcards.
pub fn validate_topic_name(topic: &str) -> Result<(), Error> {
    let invalid = |reason| {
        Err(Error::InvalidTopic {
            topic: topic.to_owned(),
            reason,
        })
    };
    if topic.is_empty() {
        return invalid("topic is empty");
    }
    if topic.split('/').any(str::is_empty) {
        return invalid("empty topic segment");
    }
    if topic.contains(['+', '#']) {
        return invalid("wildcards are not allowed in topic names");
    }
    Ok(())
}

/// Topic filters used in SUBSCRIBE: `+` as any full segment, `#` only as
/// the last full segment.
pub fn validate_topic_filter(filter: &str) -> Result<(), Error> {
    let invalid = |reason| {
        Err(Error::InvalidTopic {
            topic: filter.to_owned(),
            reason,
        })
    };
    if filter.is_empty() {
        return invalid("topic filter is empty");
    }
    let segments: Vec<&str> = filter.split('/').collect();
    let last = segments.len() - 1;
    for (i, segment) in segments.iter().enumerate() {
        if segment.is_empty() {
            return invalid("empty topic segment");
        }
        if segment.contains('#') && (*segment != "#" || i != last) {
            return invalid("'#' must be the last full segment");
        }
        if segment.contains('+') && *segment != "+" {
            return invalid("'+' must occupy a full segment");
        }
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Collector {
        id: String,
        received: Mutex<Vec<Message>>,
    }

    impl Collector {
        fn named(id: &str) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_owned(),
                ..Self::default()
            })
        }

        fn take(&self) -> Vec<Message> {
            std::mem::take(&mut *self.received.lock().unwrap())
        }
    }

    impl Receiver for Collector {
        fn id(&self) -> &str {
            &self.id
        }

        fn publish(&self, msg: &Message) {
            self.received.lock().unwrap().push(msg.clone());
        }
    }

    fn msg(topic: &str, payload: &'static str) -> Message {
        Message::new(topic, payload)
    }

    #[test]
    fn wildcard_matching() {
        let mut tree = TopicTree::new();
        let matching = ["a/b", "a/+", "+/b", "+/+", "#", "a/#"];
        let non_matching = ["a/b/c", "a/c", "b/b"];

        let mut hit = Vec::new();
        for filter in matching {
            let c = Collector::named(filter);
            tree.subscribe(filter, c.clone(), QoS::AtMostOnce).unwrap();
            hit.push(c);
        }
        let mut miss = Vec::new();
        for filter in non_matching {
            let c = Collector::named(filter);
            tree.subscribe(filter, c.clone(), QoS::AtMostOnce).unwrap();
            miss.push(c);
        }

        assert_eq!(tree.publish(&msg("a/b", "x")), matching.len());
        for c in &hit {
            assert_eq!(c.take().len(), 1, "{} should match a/b", c.id);
        }
        for c in &miss {
            assert!(c.take().is_empty(), "{} should not match a/b", c.id);
        }
    }

    #[test]
    fn multi_level_wildcard_matches_parent_level() {
        let mut tree = TopicTree::new();
        let c = Collector::named("c");
        tree.subscribe("a/#", c.clone(), QoS::AtMostOnce).unwrap();
        assert_eq!(tree.publish(&msg("a", "x")), 1);
        assert_eq!(tree.publish(&msg("a/b/c/d", "x")), 1);
        assert_eq!(tree.publish(&msg("b", "x")), 0);
    }

    #[test]
    fn retained_message_replayed_once_per_subscriber() {
        let mut tree = TopicTree::new();
        let retained = msg("a/b", "X").with_retain(true);
        tree.retain(&retained);
        tree.publish(&retained);

        for filter in ["a/b", "a/+", "#", "a/#"] {
            let c = Collector::named(filter);
            tree.subscribe(filter, c.clone(), QoS::AtLeastOnce).unwrap();
            let got = c.take();
            assert_eq!(got.len(), 1, "filter {filter}");
            assert_eq!(got[0].payload.as_ref(), b"X");
            assert!(got[0].retain);
        }

        tree.retain(&msg("a/b", "").with_retain(true));
        let late = Collector::named("late");
        tree.subscribe("#", late.clone(), QoS::AtLeastOnce).unwrap();
        assert!(late.take().is_empty());
    }

    #[test]
    fn live_delivery_clears_retain_flag() {
        let mut tree = TopicTree::new();
        let c = Collector::named("c");
        tree.subscribe("a/b", c.clone(), QoS::AtLeastOnce).unwrap();
        tree.publish(&msg("a/b", "X").with_retain(true));
        assert!(!c.take()[0].retain);
    }

    #[test]
    fn qos_is_downgraded_to_subscription() {
        let mut tree = TopicTree::new();
        let low = Collector::named("low");
        let high = Collector::named("high");
        tree.subscribe("t", low.clone(), QoS::AtMostOnce).unwrap();
        tree.subscribe("t", high.clone(), QoS::ExactlyOnce).unwrap();

        tree.publish(&msg("t", "x").with_qos(QoS::ExactlyOnce));
        assert_eq!(low.take()[0].qos, QoS::AtMostOnce);
        assert_eq!(high.take()[0].qos, QoS::ExactlyOnce);

        tree.publish(&msg("t", "x"));
        assert_eq!(high.take()[0].qos, QoS::AtMostOnce);
    }

    #[test]
    fn unsubscribe_collects_empty_nodes() {
        let mut tree = TopicTree::new();
        let c = Collector::named("c");
        for filter in ["a/b/c", "a/+/c", "+/#", "#", "x/y/z/#"] {
            let sub = tree.subscribe(filter, c.clone(), QoS::AtMostOnce).unwrap();
            assert!(tree.unsubscribe(&sub));
            assert!(tree.is_empty(), "tree not empty after {filter}");
            assert_eq!(tree.node_count(), 1);
        }
    }

    #[test]
    fn retained_node_survives_unsubscribe() {
        let mut tree = TopicTree::new();
        tree.retain(&msg("a/b", "X").with_retain(true));
        let c = Collector::named("c");
        let sub = tree.subscribe("a/b", c.clone(), QoS::AtMostOnce).unwrap();
        tree.unsubscribe(&sub);
        assert!(!tree.is_empty());

        tree.retain(&msg("a/b", "").with_retain(true));
        assert!(tree.is_empty());
    }

    #[test]
    fn unsubscribe_twice_is_a_noop() {
        let mut tree = TopicTree::new();
        let c = Collector::named("c");
        let sub = tree.subscribe("a", c, QoS::AtMostOnce).unwrap();
        assert!(tree.unsubscribe(&sub));
        assert!(!tree.unsubscribe(&sub));
    }

    #[test]
    fn topic_validation() {
        for ok in ["a", "a/b", "devices/d1/sensors/s1/value"] {
            assert!(validate_topic_name(ok).is_ok(), "{ok}");
        }
        for bad in ["", "a//b", "/a", "a/", "a/+", "a/#"] {
            assert!(validate_topic_name(bad).is_err(), "{bad}");
        }
        for ok in ["#", "+", "a/+/b", "a/#", "+/+/#"] {
            assert!(validate_topic_filter(ok).is_ok(), "{ok}");
        }
        for bad in ["", "a/#/b", "a#", "a/b+", "a//b"] {
            assert!(validate_topic_filter(bad).is_err(), "{bad}");
        }
    }
}
