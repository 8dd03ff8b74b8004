use serde_json::Value;
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DungeonInfo {
    pub hrid: String,
    pub name: String,
    pub max_waves: Option<u32>,
}

lazy_static::lazy_static! {
    static ref FALLBACK_DUNGEONS: Vec<DungeonInfo> = vec![
        fallback_dungeon("/actions/combat/chimerical_den", "Chimerical Den", 50),
        fallback_dungeon("/actions/combat/sinister_circus", "Sinister Circus", 60),
        fallback_dungeon("/actions/combat/enchanted_fortress", "Enchanted Fortress", 65),
        fallback_dungeon("/actions/combat/pirate_cove", "Pirate Cove", 65),
    ];
}

fn fallback_dungeon(hrid: &str, name: &str, max_waves: u32) -> DungeonInfo {
    DungeonInfo {
        hrid: hrid.to_string(),
        name: name.to_string(),
        max_waves: Some(max_waves),
    }
}

#[derive(Debug, Clone)]
pub struct DungeonCatalog {
    dungeons: BTreeMap<String, DungeonInfo>,
}

impl Default for DungeonCatalog {
    fn default() -> Self {
        Self::fallback()
    }
}

impl DungeonCatalog {
    pub fn fallback() -> Self {
        let dungeons = FALLBACK_DUNGEONS
            .iter()
            .map(|dungeon| (dungeon.hrid.clone(), dungeon.clone()))
            .collect();
        Self { dungeons }
    }

    /// Builds the catalog from the game's client data (`actionDetailMap`). Dungeons the client
    /// data reports without a positive `maxWaves` take the count from the fallback table.
    pub fn from_client_data(client_data: &Value) -> Self {
        let mut catalog = Self::fallback();

        let Some(action_details) = client_data
            .get("actionDetailMap")
            .and_then(Value::as_object)
        else {
            tracing::warn!("Client data has no actionDetailMap; using fallback dungeon table");
            return catalog;
        };

        for (hrid, detail) in action_details {
            let Some(combat_zone) = detail.get("combatZoneInfo") else {
                continue;
            };
            let is_dungeon = combat_zone
                .get("isDungeon")
                .and_then(Value::as_bool)
                .unwrap_or(false);
            if !is_dungeon {
                continue;
            }

            let name = detail
                .get("name")
                .and_then(Value::as_str)
                .map(str::to_string)
                .unwrap_or_else(|| display_name_from_hrid(hrid));
            let reported_waves = combat_zone
                .get("dungeonInfo")
                .and_then(|dungeon_info| dungeon_info.get("maxWaves"))
                .and_then(Value::as_u64)
                .and_then(|value| u32::try_from(value).ok())
                .filter(|value| *value > 0);
            let max_waves = reported_waves.or_else(|| {
                catalog
                    .dungeons
                    .get(hrid)
                    .and_then(|fallback| fallback.max_waves)
            });

            catalog.dungeons.insert(
                hrid.clone(),
                DungeonInfo {
                    hrid: hrid.clone(),
                    name,
                    max_waves,
                },
            );
        }

        catalog
    }

    pub fn get(&self, hrid: &str) -> Option<&DungeonInfo> {
        self.dungeons.get(hrid)
    }

    /// Looks up a dungeon by the display name chat announces it with.
    pub fn find_by_name(&self, name: &str) -> Option<&DungeonInfo> {
        let name = name.trim();
        self.dungeons
            .values()
            .find(|dungeon| dungeon.name.eq_ignore_ascii_case(name))
    }

}

pub fn display_name_from_hrid(hrid: &str) -> String {
    let slug = hrid.rsplit('/').next().unwrap_or(hrid);
    slug.split('_')
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut characters = word.chars();
            match characters.next() {
                Some(first) => first.to_uppercase().chain(characters).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::{display_name_from_hrid, DungeonCatalog};
    use serde_json::json;

    fn max_waves(catalog: &DungeonCatalog, hrid: &str) -> Option<u32> {
        catalog.get(hrid).and_then(|dungeon| dungeon.max_waves)
    }

    #[test]
    fn fallback_table_covers_known_dungeons() {
        let catalog = DungeonCatalog::fallback();

        assert_eq!(max_waves(&catalog, "/actions/combat/chimerical_den"), Some(50));
        assert_eq!(
            catalog
                .find_by_name("chimerical den")
                .map(|dungeon| dungeon.hrid.as_str()),
            Some("/actions/combat/chimerical_den")
        );
        assert!(catalog.get("/actions/combat/fly").is_none());
        assert!(catalog.find_by_name("Haunted Mill").is_none());
    }

    #[test]
    fn client_data_overrides_and_falls_back_for_zero_waves() {
        let client_data = json!({
            "actionDetailMap": {
                "/actions/combat/chimerical_den": {
                    "name": "Chimerical Den",
                    "combatZoneInfo": { "isDungeon": true, "dungeonInfo": { "maxWaves": 0 } }
                },
                "/actions/combat/new_dungeon": {
                    "name": "New Dungeon",
                    "combatZoneInfo": { "isDungeon": true, "dungeonInfo": { "maxWaves": 40 } }
                },
                "/actions/combat/mystery_vault": {
                    "combatZoneInfo": { "isDungeon": true }
                },
                "/actions/combat/fly": {
                    "name": "Fly",
                    "combatZoneInfo": { "isDungeon": false }
                }
            }
        });

        let catalog = DungeonCatalog::from_client_data(&client_data);

        assert_eq!(max_waves(&catalog, "/actions/combat/chimerical_den"), Some(50));
        assert_eq!(max_waves(&catalog, "/actions/combat/new_dungeon"), Some(40));
        assert_eq!(max_waves(&catalog, "/actions/combat/mystery_vault"), None);
        assert_eq!(
            catalog
                .get("/actions/combat/mystery_vault")
                .map(|dungeon| dungeon.name.as_str()),
            Some("Mystery Vault")
        );
        assert!(catalog.get("/actions/combat/fly").is_none());
    }

    #[test]
    fn derives_display_names_from_hrids() {
        assert_eq!(
            display_name_from_hrid("/actions/combat/sinister_circus"),
            "Sinister Circus"
        );
        assert_eq!(display_name_from_hrid("pirate_cove"), "Pirate Cove");
    }
}
