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

//! Destruction observers.
//!
//! A [`Lifeline`] is owned by some context (a channel, a command, a worker
//! supervisor). Other parties register hooks on it which run exactly once,
//! when the owner is destroyed, and may cancel their hook earlier if they
//! no longer care.

use std::cell::{Cell, RefCell};
use std::fmt::{self, Debug, Formatter};

type Hook = Box<dyn FnOnce()>;

/// Handle of a registered on-destroy hook.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct HookId(u64);

#[derive(Default)]
pub struct Lifeline {
    hooks: RefCell<Vec<(HookId, Hook)>>,
    next_id: Cell<u64>,
    destroyed: Cell<bool>,
}

impl Debug for Lifeline {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifeline")
            .field("hooks", &self.hooks.borrow().len())
            .field("destroyed", &self.destroyed.get())
            .finish()
    }
}

impl Lifeline {
    pub fn new() -> Lifeline { Lifeline::default() }

    /// Registers `hook`. If the lifeline is already destroyed the hook runs
    /// immediately.
    pub fn on_destroy(&self, hook: impl FnOnce() + 'static) -> HookId {
        let id = HookId(self.next_id.get());
        self.next_id.set(id.0 + 1);
        if self.destroyed.get() {
            hook();
        } else {
            self.hooks.borrow_mut().push((id, Box::new(hook)));
        }
        id
    }

    /// Drops a hook without running it. Returns whether it was still armed.
    pub fn cancel(&self, id: HookId) -> bool {
        let mut hooks = self.hooks.borrow_mut();
        match hooks.iter().position(|(hook_id, _)| *hook_id == id) {
            Some(pos) => {
                hooks.remove(pos);
                true
            }
            None => false,
        }
    }

    pub fn is_destroyed(&self) -> bool { self.destroyed.get() }

    #[cfg(test)]
    pub(crate) fn armed_hooks(&self) -> usize { self.hooks.borrow().len() }

    /// Runs every registered hook once, in registration order. Later calls
    /// are no-ops.
    pub fn destroy(&self) {
        if self.destroyed.replace(true) {
            return;
        }
        // hooks may register or cancel on this very lifeline
        let hooks = std::mem::take(&mut *self.hooks.borrow_mut());
        for (_, hook) in hooks {
            hook();
        }
    }
}

impl Drop for Lifeline {
    fn drop(&mut self) { self.destroy() }
}
