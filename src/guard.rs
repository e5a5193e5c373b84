use std::cell::Cell;
use std::rc::Rc;

use crate::errors::{CoordinatorError, Result};

/// call-scoped mutual-exclusion flag for mutating entry points
///
/// a second entry while a token is live fails immediately instead of
/// proceeding or blocking; the token releases the flag on every exit path
/// via `Drop`. the token holds its own handle to the flag, so holding one
/// does not borrow the guard or whatever owns it
#[derive(Debug, Default)]
pub struct ReentrancyGuard {
    engaged: Rc<Cell<bool>>,
}

impl ReentrancyGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enter(&self) -> Result<GuardToken> {
        if self.engaged.replace(true) {
            return Err(CoordinatorError::ReentrantCall);
        }
        Ok(GuardToken {
            engaged: Rc::clone(&self.engaged),
        })
    }

    pub fn is_engaged(&self) -> bool {
        self.engaged.get()
    }
}

/// live proof of exclusive entry; dropping it releases the guard
pub struct GuardToken {
    engaged: Rc<Cell<bool>>,
}

impl Drop for GuardToken {
    fn drop(&mut self) {
        self.engaged.set(false);
    }
}
