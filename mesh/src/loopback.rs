//! In-process transport for tests and the demo driver.
//!
//! Every [`LoopbackTransport`] made from one [`LoopbackHub`] shares the same
//! virtual network. Delivery is driven by the hub's own clock: nothing
//! arrives until [`LoopbackHub::advance`] has moved time past the latency of
//! the link it travelled on. Messages on a link are delivered in order.

use shared::{Channel, Endpoint, LinkId, Transport, TransportEvent};
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

const FIRST_PORT: u16 = 40000;

struct Node {
    inbox: VecDeque<(Duration, TransportEvent)>,
    alive: bool,
}

struct LinkEnd {
    owner: Endpoint,
    other: LinkId,
    open: bool,
}

struct HubState {
    now: Duration,
    latency: Duration,
    overrides: HashMap<(Endpoint, Endpoint), Duration>,
    next_link: LinkId,
    next_port: u16,
    nodes: HashMap<Endpoint, Node>,
    links: HashMap<LinkId, LinkEnd>,
}

impl HubState {
    fn latency_between(&self, a: Endpoint, b: Endpoint) -> Duration {
        self.overrides
            .get(&pair(a, b))
            .copied()
            .unwrap_or(self.latency)
    }

    /// Queues `event` for `to`, never before anything already queued from the same source.
    fn deliver(&mut self, from: Endpoint, to: Endpoint, event: TransportEvent) {
        let at = self.now + self.latency_between(from, to);
        if let Some(node) = self.nodes.get_mut(&to) {
            if node.alive {
                let at = node.inbox.back().map_or(at, |(last, _)| at.max(*last));
                node.inbox.push_back((at, event));
            }
        }
    }

    fn allocate_link(&mut self) -> LinkId {
        self.next_link += 1;
        self.next_link
    }

    /// Closes both ends and tells the far side.
    fn close(&mut self, link: LinkId, reason: &str) {
        let (owner, other) = match self.links.get_mut(&link) {
            Some(end) if end.open => {
                end.open = false;
                (end.owner, end.other)
            }
            _ => return,
        };
        let remote = match self.links.get_mut(&other) {
            Some(end) => {
                end.open = false;
                end.owner
            }
            None => return,
        };
        self.deliver(
            owner,
            remote,
            TransportEvent::Disconnected {
                link: other,
                reason: reason.to_string(),
            },
        );
    }
}

fn pair(a: Endpoint, b: Endpoint) -> (Endpoint, Endpoint) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Shared virtual network
#[derive(Clone)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl Default for LoopbackHub {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState {
                now: Duration::ZERO,
                latency: Duration::from_millis(20),
                overrides: HashMap::new(),
                next_link: 0,
                next_port: FIRST_PORT,
                nodes: HashMap::new(),
                links: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Adds a node with a fresh endpoint.
    pub fn transport(&self) -> LoopbackTransport {
        let mut state = self.lock();
        let endpoint = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), state.next_port);
        state.next_port = state.next_port.wrapping_add(1);
        state.nodes.insert(
            endpoint,
            Node {
                inbox: VecDeque::new(),
                alive: true,
            },
        );
        LoopbackTransport {
            hub: self.clone(),
            endpoint,
        }
    }

    pub fn now(&self) -> Duration {
        self.lock().now
    }

    pub fn advance(&self, elapsed: Duration) {
        self.lock().now += elapsed;
    }

    /// One-way latency for every pair without an override.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    pub fn set_link_latency(&self, a: Endpoint, b: Endpoint, latency: Duration) {
        self.lock().overrides.insert(pair(a, b), latency);
    }

    /// Drops every open link between `a` and `b` as if the route failed.
    pub fn sever(&self, a: Endpoint, b: Endpoint) {
        let mut state = self.lock();
        let doomed: Vec<LinkId> = state
            .links
            .iter()
            .filter(|(_, end)| end.open && end.owner == a)
            .filter(|(_, end)| {
                state
                    .links
                    .get(&end.other)
                    .map_or(false, |far| far.owner == b)
            })
            .map(|(link, _)| *link)
            .collect();
        for link in doomed {
            state.close(link, "connection lost");
            // Both sides notice a severed route.
            state.deliver(
                b,
                a,
                TransportEvent::Disconnected {
                    link,
                    reason: "connection lost".to_string(),
                },
            );
        }
    }

    /// Takes a node off the network. Its peers see their links drop.
    pub fn kill(&self, endpoint: Endpoint) {
        let mut state = self.lock();
        if let Some(node) = state.nodes.get_mut(&endpoint) {
            node.alive = false;
            node.inbox.clear();
        }
        let owned: Vec<LinkId> = state
            .links
            .iter()
            .filter(|(_, end)| end.open && end.owner == endpoint)
            .map(|(link, _)| *link)
            .collect();
        for link in owned {
            state.close(link, "connection lost");
        }
    }
}

pub struct LoopbackTransport {
    hub: LoopbackHub,
    endpoint: Endpoint,
}

impl LoopbackTransport {
    pub fn hub(&self) -> &LoopbackHub {
        &self.hub
    }
}

impl Transport for LoopbackTransport {
    fn local_endpoint(&self) -> Endpoint {
        self.endpoint
    }

    fn connect(&mut self, remote: Endpoint, hail: Vec<u8>) -> LinkId {
        let mut state = self.hub.lock();
        let local = state.allocate_link();
        let reachable = state.nodes.get(&remote).map_or(false, |node| node.alive);
        if !reachable {
            state.links.insert(
                local,
                LinkEnd {
                    owner: self.endpoint,
                    other: 0,
                    open: false,
                },
            );
            state.deliver(
                remote,
                self.endpoint,
                TransportEvent::Disconnected {
                    link: local,
                    reason: "unreachable".to_string(),
                },
            );
            return local;
        }

        let far = state.allocate_link();
        state.links.insert(
            local,
            LinkEnd {
                owner: self.endpoint,
                other: far,
                open: true,
            },
        );
        state.links.insert(
            far,
            LinkEnd {
                owner: remote,
                other: local,
                open: true,
            },
        );
        state.deliver(
            self.endpoint,
            remote,
            TransportEvent::IncomingConnection {
                link: far,
                remote: self.endpoint,
                hail,
            },
        );
        local
    }

    fn approve(&mut self, link: LinkId) {
        let mut state = self.hub.lock();
        let (other, remote) = match state.links.get(&link) {
            Some(end) if end.open => match state.links.get(&end.other) {
                Some(far) => (end.other, far.owner),
                None => return,
            },
            _ => return,
        };
        state.deliver(remote, self.endpoint, TransportEvent::Connected { link });
        state.deliver(self.endpoint, remote, TransportEvent::Connected { link: other });
    }

    fn deny(&mut self, link: LinkId, reason: &str) {
        self.hub.lock().close(link, reason);
    }

    fn send(&mut self, link: LinkId, channel: Channel, payload: Vec<u8>) {
        let mut state = self.hub.lock();
        let (other, remote) = match state.links.get(&link) {
            Some(end) if end.open && end.owner == self.endpoint => {
                match state.links.get(&end.other) {
                    Some(far) => (end.other, far.owner),
                    None => return,
                }
            }
            _ => return,
        };
        state.deliver(
            self.endpoint,
            remote,
            TransportEvent::Message {
                link: other,
                channel,
                payload,
            },
        );
    }

    fn disconnect(&mut self, link: LinkId, reason: &str) {
        self.hub.lock().close(link, reason);
    }

    fn round_trip_time(&self, link: LinkId) -> Option<Duration> {
        let state = self.hub.lock();
        let end = state.links.get(&link)?;
        let far = state.links.get(&end.other)?;
        Some(state.latency_between(end.owner, far.owner) * 2)
    }

    fn poll(&mut self) -> Vec<TransportEvent> {
        let mut state = self.hub.lock();
        let now = state.now;
        let node = match state.nodes.get_mut(&self.endpoint) {
            Some(node) if node.alive => node,
            _ => return Vec::new(),
        };
        let mut ready = Vec::new();
        while node.inbox.front().map_or(false, |(at, _)| *at <= now) {
            if let Some((_, event)) = node.inbox.pop_front() {
                ready.push(event);
            }
        }
        ready
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step(hub: &LoopbackHub) {
        hub.advance(Duration::from_millis(50));
    }

    #[test]
    fn test_connect_approve_send() {
        let hub = LoopbackHub::new();
        let mut a = hub.transport();
        let mut b = hub.transport();

        let link = a.connect(b.local_endpoint(), vec![7]);
        assert!(b.poll().is_empty());
        step(&hub);

        let far = match b.poll().as_slice() {
            [TransportEvent::IncomingConnection { link, remote, hail }] => {
                assert_eq!(*remote, a.local_endpoint());
                assert_eq!(hail, &vec![7]);
                *link
            }
            other => panic!("unexpected events: {:?}", other),
        };
        b.approve(far);
        b.send(far, Channel::Input, vec![1]);
        b.send(far, Channel::Input, vec![2]);
        step(&hub);

        assert_eq!(
            a.poll(),
            vec![
                TransportEvent::Connected { link },
                TransportEvent::Message {
                    link,
                    channel: Channel::Input,
                    payload: vec![1]
                },
                TransportEvent::Message {
                    link,
                    channel: Channel::Input,
                    payload: vec![2]
                },
            ]
        );
        assert_eq!(b.poll(), vec![TransportEvent::Connected { link: far }]);
        assert_eq!(a.round_trip_time(link), Some(Duration::from_millis(40)));
    }

    #[test]
    fn test_deny_reaches_initiator() {
        let hub = LoopbackHub::new();
        let mut a = hub.transport();
        let mut b = hub.transport();
        let link = a.connect(b.local_endpoint(), Vec::new());
        step(&hub);
        let far = match b.poll().pop() {
            Some(TransportEvent::IncomingConnection { link, .. }) => link,
            other => panic!("unexpected event: {:?}", other),
        };
        b.deny(far, "server full");
        step(&hub);
        assert_eq!(
            a.poll(),
            vec![TransportEvent::Disconnected {
                link,
                reason: "server full".to_string()
            }]
        );
    }

    #[test]
    fn test_unreachable_endpoint() {
        let hub = LoopbackHub::new();
        let mut a = hub.transport();
        let b = hub.transport();
        hub.kill(b.local_endpoint());
        let link = a.connect(b.local_endpoint(), Vec::new());
        step(&hub);
        assert!(matches!(
            a.poll().as_slice(),
            [TransportEvent::Disconnected { link: l, .. }] if *l == link
        ));
    }

    #[test]
    fn test_kill_drops_links() {
        let hub = LoopbackHub::new();
        let mut a = hub.transport();
        let mut b = hub.transport();
        let link = a.connect(b.local_endpoint(), Vec::new());
        step(&hub);
        let far = match b.poll().pop() {
            Some(TransportEvent::IncomingConnection { link, .. }) => link,
            other => panic!("unexpected event: {:?}", other),
        };
        b.approve(far);
        step(&hub);
        a.poll();

        hub.kill(b.local_endpoint());
        a.send(link, Channel::Input, vec![1]);
        step(&hub);
        assert!(matches!(
            a.poll().as_slice(),
            [TransportEvent::Disconnected { .. }]
        ));
        assert!(b.poll().is_empty());
    }

    #[test]
    fn test_sever_notifies_both_sides() {
        let hub = LoopbackHub::new();
        let mut a = hub.transport();
        let mut b = hub.transport();
        let link = a.connect(b.local_endpoint(), Vec::new());
        step(&hub);
        let far = match b.poll().pop() {
            Some(TransportEvent::IncomingConnection { link, .. }) => link,
            other => panic!("unexpected event: {:?}", other),
        };
        b.approve(far);
        step(&hub);
        a.poll();
        b.poll();

        hub.sever(a.local_endpoint(), b.local_endpoint());
        step(&hub);
        assert!(matches!(
            a.poll().as_slice(),
            [TransportEvent::Disconnected { link: l, .. }] if *l == link
        ));
        assert!(matches!(
            b.poll().as_slice(),
            [TransportEvent::Disconnected { link: l, .. }] if *l == far
        ));
    }

    #[test]
    fn test_per_link_latency() {
        let hub = LoopbackHub::new();
        let mut a = hub.transport();
        let mut b = hub.transport();
        hub.set_link_latency(
            a.local_endpoint(),
            b.local_endpoint(),
            Duration::from_millis(200),
        );
        a.connect(b.local_endpoint(), Vec::new());
        step(&hub);
        assert!(b.poll().is_empty());
        hub.advance(Duration::from_millis(150));
        assert_eq!(b.poll().len(), 1);
    }
}
