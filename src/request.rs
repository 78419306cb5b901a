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

//! FIFO matching of worker replies against the requests sent to it.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use crate::lifeline::{HookId, Lifeline};
use crate::wire::MsgType;

/// Classification of an incoming message type against the pending requests.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum ReplyMatch {
    /// Not a reply: status or unsolicited message.
    NotReply,
    /// Answers the oldest request; `fds` descriptors follow it.
    Reply { fds: usize },
}

/// A reply arrived for a request which is not the oldest one outstanding.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Display, Error)]
#[display("reply type {got} arrived while a reply to {expected} is due")]
pub struct ReplyMismatch {
    pub expected: MsgType,
    pub got: MsgType,
}

struct PendingRequest<C> {
    request_type: MsgType,
    reply_fds: usize,
    has_fail: bool,
    /// Emptied when the owner dies; the entry itself stays queued.
    callback: Rc<RefCell<Option<C>>>,
    disabler: Option<(Weak<Lifeline>, HookId)>,
}

impl<C> PendingRequest<C> {
    fn matches(&self, ty: MsgType) -> Option<usize> {
        if ty == self.request_type.reply() {
            Some(self.reply_fds)
        } else if self.has_fail && ty == self.request_type.reply_fail() {
            Some(0)
        } else {
            None
        }
    }
}

/// Consumed head of the request FIFO.
pub struct Answered<C> {
    pub request_type: MsgType,
    /// `None` if the owner of the request was destroyed in the meantime.
    pub callback: Option<C>,
}

pub struct RequestTracker<C> {
    pending: VecDeque<PendingRequest<C>>,
}

impl<C> Default for RequestTracker<C> {
    fn default() -> Self { RequestTracker { pending: VecDeque::new() } }
}

impl<C: 'static> RequestTracker<C> {
    pub fn new() -> Self { RequestTracker::default() }

    pub fn len(&self) -> usize { self.pending.len() }

    pub fn is_empty(&self) -> bool { self.pending.is_empty() }

    /// Queues a request at the tail. When `owner` is destroyed before the
    /// reply arrives, the callback is dropped but the entry keeps its place.
    pub fn add(
        &mut self,
        request_type: MsgType,
        reply_fds: usize,
        has_fail: bool,
        callback: C,
        owner: Option<&Rc<Lifeline>>,
    ) {
        let callback = Rc::new(RefCell::new(Some(callback)));
        let disabler = owner.map(|owner| {
            let slot = callback.clone();
            let hook = owner.on_destroy(move || {
                slot.borrow_mut().take();
            });
            (Rc::downgrade(owner), hook)
        });
        self.pending.push_back(PendingRequest {
            request_type,
            reply_fds,
            has_fail,
            callback,
            disabler,
        });
    }

    /// Checks `ty` against the head of the FIFO without consuming it.
    pub fn peek(&self, ty: MsgType) -> Result<ReplyMatch, ReplyMismatch> {
        let head = match self.pending.front() {
            None => return Ok(ReplyMatch::NotReply),
            Some(head) => head,
        };
        if let Some(fds) = head.matches(ty) {
            return Ok(ReplyMatch::Reply { fds });
        }
        if self.pending.iter().skip(1).any(|req| req.matches(ty).is_some()) {
            return Err(ReplyMismatch { expected: head.request_type, got: ty });
        }
        Ok(ReplyMatch::NotReply)
    }

    /// Removes the head of the FIFO.
    pub fn pop(&mut self) -> Option<Answered<C>> {
        let req = self.pending.pop_front()?;
        if let Some((owner, hook)) = req.disabler {
            if let Some(owner) = owner.upgrade() {
                owner.cancel(hook);
            }
        }
        let callback = req.callback.borrow_mut().take();
        Some(Answered { request_type: req.request_type, callback })
    }
}
