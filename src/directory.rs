/* This file is part of fileferry.
 *
 * fileferry is free software: you can redistribute it and/or modify
 * it under the terms of the GNU Affero General Public License as
 * published by the Free Software Foundation, either version 3 of the
 * License, or (at your option) any later version.
 *
 * fileferry is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU Affero General Public License for more details.
 *
 * You should have received a copy of the GNU Affero General Public License
 * along with fileferry.  If not, see <http://www.gnu.org/licenses/>.
 */

//! The shared, in-memory user directory.
//!
//! One `UserDirectory` is shared across every connection worker behind a
//! `Mutex`. The lock is only ever held for the duration of a `HashMap`
//! lookup or mutation -- never across I/O, crypto, or filesystem work.

use std::collections::HashMap;
use std::sync::Mutex;

use uuid::Uuid;

use crate::error::DirectoryError;

#[derive(Debug, Clone)]
pub struct User {
    pub user_name: String,
    pub uuid: Uuid,
    pub public_key: Option<[u8; crate::wire::PUBLIC_KEY_SIZE]>,
    pub aes_key: Option<[u8; 32]>,
}

impl User {
    fn new(user_name: String, uuid: Uuid) -> Self {
        User { user_name, uuid, public_key: None, aes_key: None }
    }
}

#[derive(Default)]
pub struct UserDirectory {
    users: Mutex<HashMap<String, User>>,
}

impl UserDirectory {
    pub fn new() -> Self {
        UserDirectory { users: Mutex::new(HashMap::new()) }
    }

    /// Register a brand new user, generating its uuid. Fails if the
    /// user name is already taken.
    pub fn register(&self, user_name: &str) -> Result<Uuid, DirectoryError> {
        let mut users = self.users.lock().unwrap();
        if users.contains_key(user_name) {
            return Err(DirectoryError::AlreadyExists);
        }
        let uuid = Uuid::new_v4();
        users.insert(user_name.to_string(), User::new(user_name.to_string(), uuid));
        Ok(uuid)
    }

    /// Attach (or replace) a user's RSA public key.
    pub fn set_public_key(
        &self, user_name: &str, public_key: [u8; crate::wire::PUBLIC_KEY_SIZE],
    ) -> Result<(), DirectoryError> {
        let mut users = self.users.lock().unwrap();
        let user = users.get_mut(user_name).ok_or(DirectoryError::UnknownUser)?;
        user.public_key = Some(public_key);
        Ok(())
    }

    /// Attach (or replace) a user's negotiated AES session key.
    pub fn set_aes_key(&self, user_name: &str, aes_key: [u8; 32]) -> Result<(), DirectoryError> {
        let mut users = self.users.lock().unwrap();
        let user = users.get_mut(user_name).ok_or(DirectoryError::UnknownUser)?;
        user.aes_key = Some(aes_key);
        Ok(())
    }

    /// Fetch a clone of a user's record by name.
    pub fn get(&self, user_name: &str) -> Option<User> {
        self.users.lock().unwrap().get(user_name).cloned()
    }

    /// Find a user whose uuid matches `client_id`, by linear scan -- the
    /// directory is keyed by name, and the wire protocol only ever gives
    /// us the uuid for file-upload requests.
    pub fn find_by_uuid(&self, client_id: Uuid) -> Option<User> {
        self.users.lock().unwrap().values().find(|u| u.uuid == client_id).cloned()
    }
}

#[test]
fn test_register_rejects_duplicate_names() {
    let dir = UserDirectory::new();
    dir.register("alice").unwrap();
    assert_eq!(dir.register("alice").unwrap_err(), DirectoryError::AlreadyExists);
}

#[test]
fn test_register_assigns_distinct_uuids() {
    let dir = UserDirectory::new();
    let a = dir.register("alice").unwrap();
    let b = dir.register("bob").unwrap();
    assert_ne!(a, b);
}

#[test]
fn test_set_public_key_requires_known_user() {
    let dir = UserDirectory::new();
    let err = dir.set_public_key("ghost", [0u8; crate::wire::PUBLIC_KEY_SIZE]).unwrap_err();
    assert_eq!(err, DirectoryError::UnknownUser);
}

#[test]
fn test_find_by_uuid_round_trip() {
    let dir = UserDirectory::new();
    let uuid = dir.register("carol").unwrap();
    let found = dir.find_by_uuid(uuid).unwrap();
    assert_eq!(found.user_name, "carol");
    assert!(dir.find_by_uuid(Uuid::new_v4()).is_none());
}

#[test]
fn test_set_aes_key_then_get_reflects_it() {
    let dir = UserDirectory::new();
    dir.register("dave").unwrap();
    dir.set_aes_key("dave", [9u8; 32]).unwrap();
    let user = dir.get("dave").unwrap();
    assert_eq!(user.aes_key, Some([9u8; 32]));
}
