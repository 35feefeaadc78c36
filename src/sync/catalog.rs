//! Remote Catalog Client
//!
//! Pages through the public catalog (recipes and reference commands) and
//! produces a complete [`CatalogSnapshot`]. A failed page aborts the whole
//! fetch so a truncated catalog is never presented as complete.

use crate::models::{CatalogSnapshot, Command, CraftingOption, Recipe, MAX_CRAFTING_OPTIONS};
use crate::remote::{
    fetch_all_pages, Predicate, Query, Record, RemoteError, RemoteStore, COMMAND_RECORD,
    RECIPE_RECORD,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Recipe as stored in the shared store: up to four flat ingredient lists
/// with a matching yield each
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecipeRecord {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub image: String,
    #[serde(default)]
    pub category: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingredients1: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingredients2: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingredients3: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingredients4: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count1: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count2: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count3: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count4: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remark: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl RecipeRecord {
    /// Convert into the catalog model. Empty options are dropped.
    pub fn into_recipe(self) -> Recipe {
        let raw = [
            (self.ingredients1, self.count1),
            (self.ingredients2, self.count2),
            (self.ingredients3, self.count3),
            (self.ingredients4, self.count4),
        ];

        let options: Vec<CraftingOption> = raw
            .into_iter()
            .take(MAX_CRAFTING_OPTIONS)
            .filter_map(|(ingredients, count)| {
                let option = CraftingOption::new(ingredients?, count.unwrap_or(1));
                (!option.is_empty()).then_some(option)
            })
            .collect();

        Recipe {
            id: self.id,
            name: self.name,
            image: self.image,
            options,
            category: self.category,
            remark: self.remark.filter(|r| !r.trim().is_empty()),
            note: self.note.filter(|n| !n.trim().is_empty()),
        }
    }
}

/// Reference command as stored in the shared store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandRecord {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub java: bool,
    #[serde(default)]
    pub bedrock: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub java_permission: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bedrock_permission: Option<u8>,
}

impl From<CommandRecord> for Command {
    fn from(record: CommandRecord) -> Self {
        Command {
            name: record.name,
            description: record.description,
            supports_java: record.java,
            supports_bedrock: record.bedrock,
            java_permission_level: record.java_permission,
            bedrock_permission_level: record.bedrock_permission,
        }
    }
}

/// Catalog fetcher
#[derive(Clone)]
pub struct CatalogClient {
    remote: Arc<dyn RemoteStore>,
    page_size: u32,
}

impl CatalogClient {
    pub fn new(remote: Arc<dyn RemoteStore>, page_size: u32) -> Self {
        Self {
            remote,
            page_size: page_size.max(1),
        }
    }

    /// Fetch the complete catalog, following cursors until exhausted
    pub async fn fetch_all(&self, is_manual: bool) -> Result<CatalogSnapshot, RemoteError> {
        log::info!(
            "Fetching catalog ({})",
            if is_manual { "manual" } else { "automatic" }
        );

        let recipe_query =
            Query::new(RECIPE_RECORD, Predicate::All, self.page_size).sorted_by("id", true);
        let command_query =
            Query::new(COMMAND_RECORD, Predicate::All, self.page_size).sorted_by("name", true);

        let recipe_records = fetch_all_pages(self.remote.as_ref(), &recipe_query).await?;
        let command_records = fetch_all_pages(self.remote.as_ref(), &command_query).await?;

        let recipes = decode_all::<RecipeRecord>(&recipe_records)?
            .into_iter()
            .map(RecipeRecord::into_recipe)
            .collect::<Vec<_>>();
        let commands = decode_all::<CommandRecord>(&command_records)?
            .into_iter()
            .map(Command::from)
            .collect::<Vec<_>>();

        log::info!(
            "Catalog fetched: {} recipes, {} commands",
            recipes.len(),
            commands.len()
        );
        Ok(CatalogSnapshot::new(recipes, commands))
    }
}

fn decode_all<T: serde::de::DeserializeOwned>(records: &[Record]) -> Result<Vec<T>, RemoteError> {
    records.iter().map(Record::decode).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::MemoryRemoteStore;

    fn recipe_record(id: i64, name: &str) -> Record {
        let fields = RecipeRecord {
            id,
            name: name.to_string(),
            image: format!("{}.png", name.to_lowercase()),
            category: "Misc".to_string(),
            ingredients1: Some(vec!["Stick".to_string(), "Coal".to_string()]),
            count1: Some(4),
            ..Default::default()
        };
        Record::new(RECIPE_RECORD, id.to_string(), &fields).unwrap()
    }

    #[test]
    fn test_recipe_record_conversion() {
        let record = RecipeRecord {
            id: 7,
            name: "Stairs".to_string(),
            ingredients1: Some(vec!["Planks".to_string(); 6]),
            count1: Some(4),
            ingredients2: Some(vec!["".to_string(), " ".to_string()]),
            count2: Some(4),
            ingredients3: Some(vec!["Stone".to_string()]),
            remark: Some("  ".to_string()),
            ..Default::default()
        };

        let recipe = record.into_recipe();
        // blank second option is skipped
        assert_eq!(recipe.options.len(), 2);
        assert_eq!(recipe.options[0].yield_count, 4);
        assert_eq!(recipe.options[1].yield_count, 1);
        assert!(recipe.remark.is_none());
    }

    #[test]
    fn test_command_record_conversion() {
        let command: Command = CommandRecord {
            name: "/give".to_string(),
            description: "Gives an item".to_string(),
            java: true,
            bedrock: true,
            java_permission: Some(2),
            bedrock_permission: None,
        }
        .into();

        assert!(command.supports_java);
        assert_eq!(command.java_permission_level, Some(2));
        assert!(command.bedrock_permission_level.is_none());
    }

    #[tokio::test]
    async fn test_fetch_all_pages_through_catalog() {
        let store = Arc::new(MemoryRemoteStore::new("user-1"));
        for id in (1..=5).rev() {
            store.insert_record(recipe_record(id, &format!("Item{}", id)));
        }
        store.insert_record(
            Record::new(
                COMMAND_RECORD,
                "give",
                &CommandRecord {
                    name: "/give".to_string(),
                    ..Default::default()
                },
            )
            .unwrap(),
        );

        let client = CatalogClient::new(store.clone(), 2);
        let snapshot = client.fetch_all(true).await.unwrap();

        let ids: Vec<i64> = snapshot.recipes.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
        assert_eq!(snapshot.commands.len(), 1);
        // 3 recipe pages + 1 command page
        assert_eq!(store.request_count(), 4);
    }

    #[tokio::test]
    async fn test_fetch_aborts_on_page_error() {
        let store = Arc::new(MemoryRemoteStore::new("user-1"));
        for id in 1..=5 {
            store.insert_record(recipe_record(id, "Torch"));
        }
        store.fail_queries_after(Some(2));

        let client = CatalogClient::new(store, 2);
        assert!(client.fetch_all(false).await.is_err());
    }

    #[tokio::test]
    async fn test_fetch_rejects_malformed_record() {
        let store = Arc::new(MemoryRemoteStore::new("user-1"));
        store.insert_record(
            Record::new(RECIPE_RECORD, "1", &serde_json::json!({"name": 42})).unwrap(),
        );

        let client = CatalogClient::new(store, 10);
        assert!(matches!(
            client.fetch_all(false).await,
            Err(RemoteError::InvalidResponse(_))
        ));
    }
}
