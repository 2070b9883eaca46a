//! In-memory data layer used by the bundled server binary and by tests.
//! A SQL-backed implementation would replace this behind the same trait.

use async_trait::async_trait;
use dashmap::DashMap;
use halyard_models::channel::{Channel, ChannelType};
use halyard_models::guild::Guild;

use crate::{Account, DataError, DataLayer, ReadState, UserSettings};

#[derive(Default)]
pub struct MemoryDataLayer {
    guilds: DashMap<i64, Guild>,
    accounts_by_token: DashMap<String, Account>,
    accounts_by_user: DashMap<i64, Account>,
    private_channels: DashMap<i64, Channel>,
    settings: DashMap<i64, UserSettings>,
    read_states: DashMap<i64, Vec<ReadState>>,
}

impl MemoryDataLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_guild(&self, guild: Guild) {
        self.guilds.insert(guild.id, guild);
    }

    pub fn remove_guild(&self, guild_id: i64) {
        self.guilds.remove(&guild_id);
    }

    pub fn insert_account(&self, token: &str, account: Account) {
        self.accounts_by_user
            .insert(account.user.id, account.clone());
        self.accounts_by_token.insert(token.to_string(), account);
    }

    pub fn insert_private_channel(&self, channel: Channel) {
        debug_assert!(channel.channel_type.is_private());
        self.private_channels.insert(channel.id, channel);
    }

    pub fn insert_read_state(&self, user_id: i64, state: ReadState) {
        self.read_states.entry(user_id).or_default().push(state);
    }
}

#[async_trait]
impl DataLayer for MemoryDataLayer {
    async fn get_users_guilds(&self, user_id: i64) -> Result<Vec<Guild>, DataError> {
        Ok(self
            .guilds
            .iter()
            .filter(|g| g.is_member(user_id))
            .map(|g| g.clone())
            .collect())
    }

    async fn get_guild_by_id(&self, guild_id: i64) -> Result<Option<Guild>, DataError> {
        Ok(self.guilds.get(&guild_id).map(|g| g.clone()))
    }

    async fn get_account_by_token(&self, token: &str) -> Result<Option<Account>, DataError> {
        Ok(self.accounts_by_token.get(token).map(|a| a.clone()))
    }

    async fn get_account_by_user_id(&self, user_id: i64) -> Result<Option<Account>, DataError> {
        Ok(self.accounts_by_user.get(&user_id).map(|a| a.clone()))
    }

    async fn get_private_channel_recipients(
        &self,
        channel_id: i64,
    ) -> Result<Option<Vec<i64>>, DataError> {
        Ok(self
            .private_channels
            .get(&channel_id)
            .filter(|c| matches!(c.channel_type, ChannelType::Dm | ChannelType::GroupDm))
            .map(|c| c.recipient_ids.clone()))
    }

    async fn update_settings(
        &self,
        user_id: i64,
        settings: UserSettings,
    ) -> Result<(), DataError> {
        self.settings.insert(user_id, settings);
        Ok(())
    }

    async fn get_latest_acknowledgements(
        &self,
        user_id: i64,
    ) -> Result<Vec<ReadState>, DataError> {
        Ok(self
            .read_states
            .get(&user_id)
            .map(|r| r.clone())
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use halyard_models::member::Member;
    use halyard_models::user::User;

    fn test_user(id: i64, name: &str) -> User {
        User {
            id,
            username: name.to_string(),
            discriminator: "0001".to_string(),
            avatar: None,
            bot: false,
            flags: 0,
            created_at: Utc::now(),
        }
    }

    fn test_guild(id: i64, owner_id: i64, member_ids: &[i64]) -> Guild {
        Guild {
            id,
            name: format!("guild{id}"),
            owner_id,
            members: member_ids
                .iter()
                .map(|&uid| Member {
                    user: test_user(uid, &format!("user{uid}")),
                    nick: None,
                    roles: Vec::new(),
                    joined_at: Utc::now(),
                })
                .collect(),
            roles: Vec::new(),
            channels: Vec::new(),
        }
    }

    #[tokio::test]
    async fn test_get_users_guilds_filters_by_membership() {
        let data = MemoryDataLayer::new();
        data.insert_guild(test_guild(1, 10, &[10, 11]));
        data.insert_guild(test_guild(2, 12, &[12]));

        let guilds = data.get_users_guilds(11).await.unwrap();
        assert_eq!(guilds.len(), 1);
        assert_eq!(guilds[0].id, 1);
    }

    #[tokio::test]
    async fn test_account_lookup_by_token_and_id() {
        let data = MemoryDataLayer::new();
        data.insert_account(
            "tok",
            Account {
                user: test_user(7, "seven"),
                bot: false,
            },
        );
        assert!(data.get_account_by_token("tok").await.unwrap().is_some());
        assert!(data.get_account_by_token("nope").await.unwrap().is_none());
        assert_eq!(
            data.get_account_by_user_id(7)
                .await
                .unwrap()
                .unwrap()
                .user
                .username,
            "seven"
        );
    }

    #[tokio::test]
    async fn test_private_channel_recipients() {
        let data = MemoryDataLayer::new();
        data.insert_private_channel(Channel {
            id: 50,
            channel_type: ChannelType::GroupDm,
            guild_id: None,
            name: None,
            position: 0,
            parent_id: None,
            overwrites: Vec::new(),
            recipient_ids: vec![1, 2, 3],
        });
        let recipients = data.get_private_channel_recipients(50).await.unwrap();
        assert_eq!(recipients, Some(vec![1, 2, 3]));
        assert_eq!(data.get_private_channel_recipients(51).await.unwrap(), None);
    }
}
