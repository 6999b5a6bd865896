//! Per-process handle table.
use crate::utils::sync::Arc;

use super::{
    error::{KernelError, KernelResult},
    types::{GuestProcess, GuestThread, Handle, SyncObject},
};

/// Anything a handle can name.
#[derive(Debug, Clone)]
pub enum KernelObject {
    Thread(Arc<GuestThread>),
    Process(Arc<GuestProcess>),
    Sync(Arc<SyncObject>),
}

impl KernelObject {
    pub fn type_name(&self) -> &'static str {
        match self {
            KernelObject::Thread(_) => "thread",
            KernelObject::Process(_) => "process",
            KernelObject::Sync(_) => "sync object",
        }
    }
}

/// Maps handles to shared kernel objects.
///
/// An entry keeps its object alive; closing the last handle to an object that
/// nothing else references frees it. Freed slots are reused most recent first.
#[derive(Debug)]
pub struct HandleTable {
    slots: Vec<Option<KernelObject>>,
    free: Vec<usize>,
    capacity: usize,
    live: usize,
}

impl HandleTable {
    pub const FIRST_HANDLE: u32 = 0xD000;

    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            capacity,
            live: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    pub fn insert(&mut self, object: KernelObject) -> KernelResult<Handle> {
        let index = match self.free.pop() {
            Some(index) => index,
            None if self.slots.len() < self.capacity => {
                self.slots.push(None);
                self.slots.len() - 1
            }
            None => return Err(KernelError::OutOfHandles),
        };
        self.slots[index] = Some(object);
        self.live += 1;
        Ok(Handle(Self::FIRST_HANDLE + index as u32))
    }

    fn index(&self, handle: Handle) -> KernelResult<usize> {
        handle
            .raw()
            .checked_sub(Self::FIRST_HANDLE)
            .map(|i| i as usize)
            .filter(|&i| i < self.slots.len())
            .ok_or(KernelError::InvalidHandle(handle.raw()))
    }

    pub fn get(&self, handle: Handle) -> KernelResult<KernelObject> {
        let index = self.index(handle)?;
        self.slots[index]
            .clone()
            .ok_or(KernelError::InvalidHandle(handle.raw()))
    }

    pub fn close(&mut self, handle: Handle) -> KernelResult<KernelObject> {
        let index = self.index(handle)?;
        let object = self.slots[index]
            .take()
            .ok_or(KernelError::InvalidHandle(handle.raw()))?;
        self.free.push(index);
        self.live -= 1;
        Ok(object)
    }

    /// Empty the table, returning what it held so the caller controls when
    /// the references drop.
    pub fn clear(&mut self) -> Vec<KernelObject> {
        self.free.clear();
        self.live = 0;
        self.slots.drain(..).flatten().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::types::{MutexState, ObjectId};

    fn object(id: u64) -> KernelObject {
        KernelObject::Sync(Arc::new(SyncObject::new(
            ObjectId(id),
            MutexState::default(),
        )))
    }

    #[test]
    fn test_handles_start_at_base_and_reuse_slots() {
        let mut table = HandleTable::new(4);
        let a = table.insert(object(1)).unwrap();
        let b = table.insert(object(2)).unwrap();
        assert_eq!(a, Handle(0xD000));
        assert_eq!(b, Handle(0xD001));

        table.close(a).unwrap();
        assert_eq!(table.get(a).unwrap_err(), KernelError::InvalidHandle(0xD000));
        assert_eq!(table.insert(object(3)).unwrap(), a);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_full_table_reports_out_of_handles() {
        let mut table = HandleTable::new(1);
        table.insert(object(1)).unwrap();
        assert_eq!(table.insert(object(2)).unwrap_err(), KernelError::OutOfHandles);
    }

    #[test]
    fn test_unknown_handles_are_rejected() {
        let mut table = HandleTable::new(4);
        assert!(table.get(Handle(0)).is_err());
        assert!(table.get(Handle(0xD005)).is_err());
        assert!(table.close(Handle::CURRENT_THREAD).is_err());
    }

    #[test]
    fn test_closing_last_handle_frees_object() {
        let mut table = HandleTable::new(4);
        let shared = Arc::new(SyncObject::new(ObjectId(1), MutexState::default()));
        let handle = table.insert(KernelObject::Sync(shared.clone())).unwrap();
        assert_eq!(Arc::strong_count(&shared), 2);

        drop(table.close(handle).unwrap());
        assert_eq!(Arc::strong_count(&shared), 1);
        assert!(table.clear().is_empty());
    }
}
