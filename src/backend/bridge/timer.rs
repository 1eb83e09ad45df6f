// SPDX-License-Identifier: GPL-3.0-only

use crate::window::WindowId;
use calloop::{
    timer::{TimeoutAction, Timer},
    LoopHandle, RegistrationToken,
};
use std::{collections::HashMap, time::Duration};
use tracing::{error, trace};

/// One-shot timers keyed by top-level window
pub trait FallbackTimer {
    /// (Re)start the timer of `toplevel` to fire after `after`
    fn arm(&mut self, toplevel: WindowId, after: Duration);

    fn disarm(&mut self, toplevel: WindowId);

    /// The timer of `toplevel` just fired and is gone
    fn fired(&mut self, _toplevel: WindowId) {}
}

/// Receiver of fallback timer expirations
pub trait FallbackTimerHandler {
    fn fallback_timer_fired(&mut self, toplevel: WindowId);
}

/// [`FallbackTimer`] on a calloop event loop
pub struct CalloopTimer<D: 'static> {
    handle: LoopHandle<'static, D>,
    tokens: HashMap<WindowId, RegistrationToken>,
}

impl<D: 'static> CalloopTimer<D> {
    pub fn new(handle: LoopHandle<'static, D>) -> Self {
        Self {
            handle,
            tokens: HashMap::new(),
        }
    }
}

impl<D: FallbackTimerHandler + 'static> FallbackTimer for CalloopTimer<D> {
    fn arm(&mut self, toplevel: WindowId, after: Duration) {
        self.disarm(toplevel);

        let timer = Timer::from_duration(after);
        match self.handle.insert_source(timer, move |_, _, data| {
            data.fallback_timer_fired(toplevel);
            TimeoutAction::Drop
        }) {
            Ok(token) => {
                trace!("Fallback timer for {} armed for {:?}", toplevel, after);
                self.tokens.insert(toplevel, token);
            }
            Err(err) => error!("Failed to arm fallback timer for {}: {}", toplevel, err.error),
        }
    }

    fn disarm(&mut self, toplevel: WindowId) {
        if let Some(token) = self.tokens.remove(&toplevel) {
            self.handle.remove(token);
        }
    }

    fn fired(&mut self, toplevel: WindowId) {
        // the source drops itself
        self.tokens.remove(&toplevel);
    }
}
