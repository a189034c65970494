//! Double-buffered frame hand-off between the capture step and the render path.
//!
//! The capture step converts into a back buffer it owns, then swaps it with the shared front
//! buffer under the exchange lock and raises a dirty flag. The render path takes the same lock,
//! swaps a pending front buffer into its own upload buffer and clears the flag, then uploads
//! after the lock is released. Only pointer swaps happen under the lock, so neither side waits
//! on the other's conversion or upload, and the consumer never sees a half-written frame.
//!
//! [`SessionLocks`] fixes the acquisition order session, graphics, exchange. Bring-up and
//! teardown take all three, the capture step takes session then exchange, and the render path
//! takes graphics then exchange.

use std::mem;
use std::ops::{Deref, DerefMut};

use parking_lot::{Mutex, MutexGuard};

/// Front buffer plus the "new frame available" flag.
#[derive(Debug, Default)]
pub struct FrameExchange {
    front: Vec<u8>,
    dirty: bool,
}

impl FrameExchange {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swaps `back` into the front slot and marks it dirty.
    ///
    /// `back` receives the previous front buffer, ready to be overwritten by the next frame.
    pub fn publish(&mut self, back: &mut Vec<u8>) {
        mem::swap(&mut self.front, back);
        self.dirty = true;
    }

    /// Hands a frame published since the last call over to `upload`, clearing the flag.
    ///
    /// Returns false and leaves `upload` untouched when nothing new was published.
    pub fn consume(&mut self, upload: &mut Vec<u8>) -> bool {
        if !mem::take(&mut self.dirty) {
            return false;
        }
        mem::swap(&mut self.front, upload);
        true
    }

    /// Whether an unconsumed frame is waiting.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// The most recently published frame, unless it has been consumed.
    pub fn front(&self) -> &[u8] {
        &self.front
    }

    /// Resizes the front buffer to `len` zero bytes and drops any pending frame.
    pub fn reset(&mut self, len: usize) {
        self.front.clear();
        self.front.resize(len, 0);
        self.dirty = false;
    }

    /// Frees the front buffer.
    pub fn release(&mut self) {
        self.front = Vec::new();
        self.dirty = false;
    }
}

/// The session, graphics and exchange mutexes with a fixed acquisition order.
///
/// Guards only hand out later locks in the order above. Nothing stops a caller from calling
/// [`lock_session`](Self::lock_session) while holding a [`ConsumerGuard`]; the render path
/// must never do so.
#[derive(Debug, Default)]
pub struct SessionLocks<S, G, X> {
    session: Mutex<S>,
    graphics: Mutex<G>,
    exchange: Mutex<X>,
}

impl<S, G, X> SessionLocks<S, G, X> {
    pub fn new(session: S, graphics: G, exchange: X) -> Self {
        Self {
            session: Mutex::new(session),
            graphics: Mutex::new(graphics),
            exchange: Mutex::new(exchange),
        }
    }

    /// Blocks until the session lock is held.
    pub fn lock_session(&self) -> SessionGuard<'_, S, G, X> {
        SessionGuard {
            session: self.session.lock(),
            graphics: &self.graphics,
            exchange: &self.exchange,
        }
    }

    /// Takes the session lock only if it is free.
    pub fn try_lock_session(&self) -> Option<SessionGuard<'_, S, G, X>> {
        self.session.try_lock().map(|session| SessionGuard {
            session,
            graphics: &self.graphics,
            exchange: &self.exchange,
        })
    }

    /// Render path: the graphics lock, with the exchange lock reachable beneath it.
    pub fn lock_consumer(&self) -> ConsumerGuard<'_, G, X> {
        ConsumerGuard {
            graphics: self.graphics.lock(),
            exchange: &self.exchange,
        }
    }
}

/// Holds the session lock and grants access to the locks beneath it.
pub struct SessionGuard<'a, S, G, X> {
    session: MutexGuard<'a, S>,
    graphics: &'a Mutex<G>,
    exchange: &'a Mutex<X>,
}

impl<'a, S, G, X> SessionGuard<'a, S, G, X> {
    /// Locks graphics then exchange while keeping the session.
    pub fn lock_all(&mut self) -> (&mut S, MutexGuard<'_, G>, MutexGuard<'_, X>) {
        let graphics = self.graphics.lock();
        let exchange = self.exchange.lock();
        (&mut *self.session, graphics, exchange)
    }

    /// Splits into the session state and a gate for taking the exchange lock later.
    pub fn split(&mut self) -> (&mut S, ExchangeGate<'_, X>) {
        (
            &mut *self.session,
            ExchangeGate {
                exchange: self.exchange,
            },
        )
    }
}

impl<S, G, X> Deref for SessionGuard<'_, S, G, X> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.session
    }
}

impl<S, G, X> DerefMut for SessionGuard<'_, S, G, X> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.session
    }
}

/// Holds the graphics lock for the render path.
pub struct ConsumerGuard<'a, G, X> {
    graphics: MutexGuard<'a, G>,
    exchange: &'a Mutex<X>,
}

impl<'a, G, X> ConsumerGuard<'a, G, X> {
    /// Splits into the graphics state and a gate for briefly taking the exchange lock.
    pub fn split(&mut self) -> (&mut G, ExchangeGate<'_, X>) {
        (
            &mut *self.graphics,
            ExchangeGate {
                exchange: self.exchange,
            },
        )
    }
}

/// Permission to take the exchange lock, only obtainable while an outer lock is held.
pub struct ExchangeGate<'g, X> {
    exchange: &'g Mutex<X>,
}

impl<'g, X> ExchangeGate<'g, X> {
    pub fn lock(&self) -> MutexGuard<'g, X> {
        self.exchange.lock()
    }
}
