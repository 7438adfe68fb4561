//! Protocol id allocation of a connection

use std::cmp::Ordering;

use crate::protocol::SERVER_ID_LIMIT;

/// The id cannot be used for a new object
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub(crate) struct InvalidNewId(pub u32);

/// The objects of a connection by protocol id
///
/// Ids below [`SERVER_ID_LIMIT`] are allocated by the client, the others by the server. Both sides
/// allocate the lowest free id of their namespace, which keeps the maps of the two ends of a
/// connection in sync.
#[derive(Debug)]
pub(crate) struct IdMap<T> {
    client_objects: Vec<Option<T>>,
    server_objects: Vec<Option<T>>,
}

impl<T> IdMap<T> {
    pub fn new() -> Self {
        Self { client_objects: Vec::new(), server_objects: Vec::new() }
    }

    fn slot(&self, id: u32) -> Option<&Option<T>> {
        if id == 0 {
            None
        } else if id >= SERVER_ID_LIMIT {
            self.server_objects.get((id - SERVER_ID_LIMIT) as usize)
        } else {
            self.client_objects.get((id - 1) as usize)
        }
    }

    fn slot_mut(&mut self, id: u32) -> Option<&mut Option<T>> {
        if id == 0 {
            None
        } else if id >= SERVER_ID_LIMIT {
            self.server_objects.get_mut((id - SERVER_ID_LIMIT) as usize)
        } else {
            self.client_objects.get_mut((id - 1) as usize)
        }
    }

    pub fn find(&self, id: u32) -> Option<&T> {
        self.slot(id)?.as_ref()
    }

    pub fn find_mut(&mut self, id: u32) -> Option<&mut T> {
        self.slot_mut(id)?.as_mut()
    }

    /// Free an id, returning what it held
    pub fn remove(&mut self, id: u32) -> Option<T> {
        self.slot_mut(id)?.take()
    }

    /// Use the id chosen by the other end of the connection
    ///
    /// Fails if the id is neither free nor the next one of its namespace.
    pub fn insert_at(&mut self, id: u32, object: T) -> Result<(), InvalidNewId> {
        let (store, index) = if id == 0 {
            return Err(InvalidNewId(id));
        } else if id >= SERVER_ID_LIMIT {
            (&mut self.server_objects, (id - SERVER_ID_LIMIT) as usize)
        } else {
            (&mut self.client_objects, (id - 1) as usize)
        };
        match index.cmp(&store.len()) {
            Ordering::Greater => Err(InvalidNewId(id)),
            Ordering::Equal => {
                store.push(Some(object));
                Ok(())
            }
            Ordering::Less if store[index].is_none() => {
                store[index] = Some(object);
                Ok(())
            }
            Ordering::Less => Err(InvalidNewId(id)),
        }
    }

    /// Allocate an id in the client namespace
    pub fn client_insert_new(&mut self, object: T) -> u32 {
        insert_in(&mut self.client_objects, object) + 1
    }

    /// Allocate an id in the server namespace
    pub fn server_insert_new(&mut self, object: T) -> u32 {
        insert_in(&mut self.server_objects, object) + SERVER_ID_LIMIT
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        let client_side = self
            .client_objects
            .iter()
            .enumerate()
            .filter_map(|(idx, obj)| obj.as_ref().map(|obj| (idx as u32 + 1, obj)));
        let server_side = self
            .server_objects
            .iter()
            .enumerate()
            .filter_map(|(idx, obj)| obj.as_ref().map(|obj| (idx as u32 + SERVER_ID_LIMIT, obj)));
        client_side.chain(server_side)
    }
}

// first free place, or a new one at the end
fn insert_in<T>(store: &mut Vec<Option<T>>, object: T) -> u32 {
    match store.iter().position(Option::is_none) {
        Some(idx) => {
            store[idx] = Some(object);
            idx as u32
        }
        None => {
            store.push(Some(object));
            (store.len() - 1) as u32
        }
    }
}
