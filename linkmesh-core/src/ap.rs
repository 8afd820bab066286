//! Access point ownership: only one instance may run the AP at a time.
//!
//! The host keeps one [`ApController`]. Ownership is a weak reference, so a
//! dropped owner releases the AP without an explicit deactivation.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use crate::radio::RadioError;

/// Something that can run the shared access point.
pub trait ApRole {
    /// Bring the AP up. Runs before ownership is recorded.
    fn activate_ap_hook(&mut self) -> Result<(), RadioError>;

    fn deactivate_ap_hook(&mut self);

    /// The station connected on `channel`; the AP must follow it.
    fn retune_ap(&mut self, channel: u8);
}

#[derive(Default)]
pub struct ApController {
    owner: Option<Weak<RefCell<dyn ApRole>>>,
}

impl ApController {
    pub fn new() -> Self {
        Self { owner: None }
    }

    fn current(&self) -> Option<Rc<RefCell<dyn ApRole>>> {
        self.owner.as_ref().and_then(Weak::upgrade)
    }

    pub fn has_owner(&self) -> bool {
        self.current().is_some()
    }

    pub fn is_owner(&self, candidate: &Rc<RefCell<dyn ApRole>>) -> bool {
        self.current()
            .map(|o| Rc::ptr_eq(&o, candidate))
            .unwrap_or(false)
    }

    /// Hand the AP to `candidate`, deactivating the previous owner first.
    /// On hook failure nobody owns the AP.
    pub fn activate_ap(&mut self, candidate: &Rc<RefCell<dyn ApRole>>) -> Result<(), RadioError> {
        if self.is_owner(candidate) {
            return Ok(());
        }
        if let Some(previous) = self.current() {
            previous.borrow_mut().deactivate_ap_hook();
        }
        self.owner = None;
        candidate.borrow_mut().activate_ap_hook()?;
        self.owner = Some(Rc::downgrade(candidate));
        Ok(())
    }

    /// Stop the AP if `candidate` owns it. Returns false otherwise.
    pub fn deactivate_ap(&mut self, candidate: &Rc<RefCell<dyn ApRole>>) -> bool {
        if !self.is_owner(candidate) {
            return false;
        }
        candidate.borrow_mut().deactivate_ap_hook();
        self.owner = None;
        true
    }

    /// Station mode dominates channel selection.
    pub fn on_station_connected(&mut self, channel: u8) {
        if let Some(owner) = self.current() {
            owner.borrow_mut().retune_ap(channel);
        }
    }
}
