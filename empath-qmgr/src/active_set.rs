//! Active-set controller (C4): leaky-bucket cap on in-core messages, with
//! strict one-and-one alternation between the incoming and deferred
//! scanners.

/// Whether the main loop should immediately run another iteration or wait
/// for the next timer/I-O/trigger event, mirroring `qmgr_loop`'s
/// `DONT_WAIT`/`WAIT_FOR_EVENT` return value in the original source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopAction {
    DontWait,
    WaitForEvent,
}

/// Tracks how many messages are currently held in core and enforces the
/// active-queue limit.
#[derive(Debug)]
pub struct ActiveSetController {
    limit: usize,
    in_core: usize,
}

impl ActiveSetController {
    #[must_use]
    pub const fn new(limit: usize) -> Self {
        Self { limit, in_core: 0 }
    }

    #[must_use]
    pub const fn in_core(&self) -> usize {
        self.in_core
    }

    #[must_use]
    pub const fn has_room(&self) -> bool {
        self.in_core < self.limit
    }

    pub fn admit(&mut self) {
        debug_assert!(self.has_room(), "admitted past the active-queue limit");
        self.in_core += 1;
    }

    pub fn release(&mut self) {
        self.in_core = self.in_core.saturating_sub(1);
    }
}

/// Drains one admission attempt each from the incoming and deferred
/// scanners, in that fixed order, regardless of whether the first
/// succeeded — the exact one-and-one alternation this fairness guarantee
/// requires.
pub async fn admit_one_round<F, G, Fut1, Fut2>(
    controller: &mut ActiveSetController,
    mut admit_incoming: F,
    mut admit_deferred: G,
) -> LoopAction
where
    F: FnMut() -> Fut1,
    G: FnMut() -> Fut2,
    Fut1: std::future::Future<Output = bool>,
    Fut2: std::future::Future<Output = bool>,
{
    let mut admitted_any = false;

    if controller.has_room() {
        if admit_incoming().await {
            controller.admit();
            admitted_any = true;
        }
    }

    if controller.has_room() {
        if admit_deferred().await {
            controller.admit();
            admitted_any = true;
        }
    }

    if admitted_any {
        LoopAction::DontWait
    } else {
        LoopAction::WaitForEvent
    }
}
