// LNP Node: node running lightning network protocol and generalized lightning
// channels.
// Written in 2020-2022 by
//     Dr. Maxim Orlovsky <orlovsky@pandoracore.com>
//
// To the extent possible under law, the author(s) have dedicated all
// copyright and related and neighboring rights to this software to
// the public domain worldwide. This software is distributed without
// any warranty.
//
// You should have received a copy of the MIT License
// along with this software.
// If not, see <https://opensource.org/licenses/MIT>.

use std::collections::VecDeque;
use std::os::fd::OwnedFd;
use std::sync::{Mutex, PoisonError};

use tokio::sync::Notify;

use crate::wire::Message;

/// Item waiting to be written to a worker.
#[derive(Debug)]
pub enum Outgoing {
    Msg(Message),
    Fd(OwnedFd),
}

/// Outbound FIFO of one worker connection. Messages and descriptor
/// handoffs leave in exactly the order they were queued.
#[derive(Debug, Default)]
pub struct OutboundQueue {
    items: Mutex<VecDeque<Outgoing>>,
    ready: Notify,
}

impl OutboundQueue {
    pub fn new() -> OutboundQueue { OutboundQueue::default() }

    pub fn enqueue(&self, msg: Message) { self.push(Outgoing::Msg(msg)) }

    pub fn enqueue_fd(&self, fd: OwnedFd) { self.push(Outgoing::Fd(fd)) }

    /// Pops the next item, `None` if the queue is empty.
    pub fn dequeue(&self) -> Option<Outgoing> {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).pop_front()
    }

    pub fn len(&self) -> usize { self.items.lock().unwrap_or_else(PoisonError::into_inner).len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    /// Resolves once an item has been queued since the last wake-up. A
    /// wake-up issued while nobody waits is kept for the next waiter.
    pub async fn wait(&self) { self.ready.notified().await }

    fn push(&self, item: Outgoing) {
        self.items.lock().unwrap_or_else(PoisonError::into_inner).push_back(item);
        self.ready.notify_one();
    }
}
