//! `acc:u0`: user accounts.

use std::sync::Arc;

use once_cell::sync::Lazy;
use serde::{Deserialize, Deserializer};

use crate::context::RequestContext;
use crate::interface::{CommandTable, HandlerResult, SessionHandler};

pub const NAME: &str = "acc:u0";
pub const MAX_USERS: usize = 8;

pub type Uuid = [u8; 16];

fn hex_uuid<'de, D: Deserializer<'de>>(d: D) -> Result<Uuid, D::Error> {
    let s = String::deserialize(d)?;
    let mut out = [0u8; 16];
    hex::decode_to_slice(s.trim(), &mut out).map_err(serde::de::Error::custom)?;
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UserProfile {
    /// 32 hex digits in configuration files.
    #[serde(deserialize_with = "hex_uuid")]
    pub uuid: Uuid,
    pub nickname: String,
}

impl Default for UserProfile {
    fn default() -> Self {
        let mut uuid = [0u8; 16];
        uuid[0] = 1;
        Self {
            uuid,
            nickname: "player".to_string(),
        }
    }
}

static COMMANDS: Lazy<CommandTable<AccountService>> = Lazy::new(|| {
    CommandTable::new(NAME)
        .with(0, "GetUserCount", AccountService::get_user_count)
        .with(1, "GetUserExistence", AccountService::get_user_existence)
        .with(2, "ListAllUsers", AccountService::list_all_users)
        .with(3, "ListOpenUsers", AccountService::list_open_users)
        .with(4, "GetLastOpenedUser", AccountService::get_last_opened_user)
});

pub struct AccountService {
    users: Arc<Vec<UserProfile>>,
}

impl AccountService {
    pub fn new(users: Arc<Vec<UserProfile>>) -> Self {
        Self { users }
    }

    fn get_user_count(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
        ctx.push_u32(self.users.len() as u32);
        Ok(())
    }

    fn get_user_existence(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
        let uuid: Uuid = ctx.pop_bytes()?;
        let exists = uuid != [0; 16] && self.users.iter().any(|u| u.uuid == uuid);
        ctx.push_bool(exists);
        Ok(())
    }

    /// Writes up to `MAX_USERS` ids to the output buffer, zero padded.
    fn write_users<'a>(ctx: &mut RequestContext<'_>, users: impl Iterator<Item = &'a UserProfile>) -> HandlerResult {
        let mut out = vec![0u8; MAX_USERS * 16];
        for (slot, user) in out.chunks_exact_mut(16).zip(users) {
            slot.copy_from_slice(&user.uuid);
        }
        ctx.write_buffer(0, &out)?;
        Ok(())
    }

    fn list_all_users(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
        let users = self.users.clone();
        Self::write_users(ctx, users.iter())
    }

    /// Only the first profile counts as signed in.
    fn list_open_users(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
        let users = self.users.clone();
        Self::write_users(ctx, users.iter().take(1))
    }

    fn get_last_opened_user(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
        let uuid = self.users.first().map_or([0; 16], |u| u.uuid);
        ctx.push_bytes(&uuid);
        Ok(())
    }
}

impl SessionHandler for AccountService {
    fn name(&self) -> &str {
        NAME
    }

    fn handle_request(&mut self, ctx: &mut RequestContext<'_>) -> HandlerResult {
        COMMANDS.dispatch(self, ctx)
    }
}
