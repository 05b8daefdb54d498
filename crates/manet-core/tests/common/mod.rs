//! Shared helpers for integration tests.

#![allow(dead_code)]

use manet_core::{ManetIssue, ManetListener, NodeAddress, Packet, TransportStatus};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

/// How long tests wait for asynchronous events
pub const WAIT: Duration = Duration::from_secs(10);

#[derive(Default)]
struct Events {
    statuses: Vec<TransportStatus>,
    issues: Vec<ManetIssue>,
    devices: Vec<NodeAddress>,
    rx: Vec<Packet>,
    latencies: Vec<(NodeAddress, i64)>,
    authenticated: usize,
}

/// Listener that records every callback and lets tests wait for them
#[derive(Default)]
pub struct RecordingListener {
    events: Mutex<Events>,
    changed: Condvar,
}

impl RecordingListener {
    fn record(&self, f: impl FnOnce(&mut Events)) {
        f(&mut self.events.lock().unwrap());
        self.changed.notify_all();
    }

    /// Block until `pred` holds or `WAIT` passes; returns the last result
    fn wait_for<T>(&self, mut pred: impl FnMut(&Events) -> Option<T>) -> Option<T> {
        let guard = self.events.lock().unwrap();
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, WAIT, |events| pred(events).is_none())
            .unwrap();
        pred(&guard)
    }

    pub fn wait_for_status(&self, status: TransportStatus) -> bool {
        self.wait_for(|e| e.statuses.contains(&status).then_some(()))
            .is_some()
    }

    /// Wait until `status` has been reported at least `times` times
    pub fn wait_for_status_count(&self, status: TransportStatus, times: usize) -> bool {
        self.wait_for(|e| {
            (e.statuses.iter().filter(|s| **s == status).count() >= times).then_some(())
        })
        .is_some()
    }

    pub fn wait_for_rx(&self, count: usize) -> Option<Vec<Packet>> {
        self.wait_for(|e| (e.rx.len() >= count).then(|| e.rx.clone()))
    }

    pub fn wait_for_latency(&self) -> Option<(NodeAddress, i64)> {
        self.wait_for(|e| e.latencies.first().copied())
    }

    pub fn wait_for_device(&self, peer: NodeAddress) -> bool {
        self.wait_for(|e| e.devices.contains(&peer).then_some(()))
            .is_some()
    }

    pub fn issues(&self) -> Vec<ManetIssue> {
        self.events.lock().unwrap().issues.clone()
    }

    pub fn authenticated_count(&self) -> usize {
        self.events.lock().unwrap().authenticated
    }
}

impl ManetListener for RecordingListener {
    fn on_status(&self, status: TransportStatus) {
        self.record(|e| e.statuses.push(status));
    }

    fn on_issue(&self, issue: &ManetIssue) {
        let issue = issue.clone();
        self.record(|e| e.issues.push(issue));
    }

    fn on_devices_changed(&self, peer: NodeAddress) {
        self.record(|e| e.devices.push(peer));
    }

    fn on_authenticated_on_net(&self) {
        self.record(|e| e.authenticated += 1);
    }

    fn on_rx(&self, packet: &Packet) {
        let packet = packet.clone();
        self.record(|e| e.rx.push(packet));
    }

    fn on_latency(&self, peer: NodeAddress, rtt_ms: i64) {
        self.record(|e| e.latencies.push((peer, rtt_ms)));
    }
}
