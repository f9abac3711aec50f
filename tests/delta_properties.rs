//! 增量完备性属性测试：任意分类结果应用后再逆转，世界状态与应用前一致

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use aventura::classifier::{
        CharacterChanges, CharacterUpdate, ClassificationResult, EntryUpdates, ItemChanges,
        ItemUpdate, LocationChanges, LocationUpdate, NewCharacter, NewItem, NewLocation,
        NewStoryBeat, SceneUpdate, StoryBeatChanges, StoryBeatUpdate,
    };
    use aventura::rollback::RollbackEngine;
    use aventura::store::{InMemoryWorldStore, WorldStore};
    use aventura::world::{
        Character, ClassificationApplier, EntryType, Item, Location, StoryBeat, StoryEntry,
        StoryScope, WorldView,
    };
    use chrono::Utc;
    use proptest::prelude::*;

    const CHARACTERS: &[&str] = &["Mara", "Rhys", "Ilse", "Tova", "Ewan"];
    const LOCATIONS: &[&str] = &["Docks", "Inn", "Lighthouse", "Chapel"];
    const ITEMS: &[&str] = &["Rope", "Lantern", "Key"];
    const BEATS: &[&str] = &["Find the map", "Escape the storm", "Old debt"];
    const TRAITS: &[&str] = &["brave", "wounded", "tired", "suspicious"];

    fn pick(pool: &'static [&'static str]) -> impl Strategy<Value = String> {
        prop::sample::select(pool).prop_map(|s| s.to_string())
    }

    fn maybe_status(pool: &'static [&'static str]) -> impl Strategy<Value = Option<String>> {
        prop::option::of(pick(pool))
    }

    fn character_update() -> impl Strategy<Value = CharacterUpdate> {
        (
            pick(CHARACTERS),
            maybe_status(&["active", "inactive", "deceased", "vanished"]),
            prop::option::of(pick(&["ally", "rival", "stranger"])),
            prop::collection::vec(pick(TRAITS), 0..3),
            prop::collection::vec(pick(TRAITS), 0..2),
        )
            .prop_map(|(name, status, relationship, add_traits, remove_traits)| CharacterUpdate {
                name,
                changes: CharacterChanges {
                    status,
                    relationship,
                    add_traits,
                    remove_traits,
                    ..Default::default()
                },
            })
    }

    fn location_update() -> impl Strategy<Value = LocationUpdate> {
        (
            pick(LOCATIONS),
            prop::option::of(any::<bool>()),
            prop::option::of(pick(&["Burned.", "Crowded.", "Silent."])),
        )
            .prop_map(|(name, visited, description)| LocationUpdate {
                name,
                changes: LocationChanges {
                    visited,
                    description,
                    ..Default::default()
                },
            })
    }

    fn item_update() -> impl Strategy<Value = ItemUpdate> {
        (
            pick(ITEMS),
            prop::option::of(0u32..5),
            prop::option::of(any::<bool>()),
            prop::option::of(pick(&["inventory", "Inn", "lost"])),
        )
            .prop_map(|(name, quantity, equipped, location)| ItemUpdate {
                name,
                changes: ItemChanges {
                    quantity,
                    equipped,
                    location,
                    ..Default::default()
                },
            })
    }

    fn beat_update() -> impl Strategy<Value = StoryBeatUpdate> {
        (
            pick(BEATS),
            maybe_status(&["pending", "active", "completed", "failed"]),
            prop::option::of(pick(&["It grows urgent.", "Nearly done."])),
        )
            .prop_map(|(title, status, description)| StoryBeatUpdate {
                title,
                changes: StoryBeatChanges {
                    status,
                    description,
                    ..Default::default()
                },
            })
    }

    fn classification() -> impl Strategy<Value = ClassificationResult> {
        let updates = (
            prop::collection::vec(character_update(), 0..4),
            prop::collection::vec(location_update(), 0..3),
            prop::collection::vec(item_update(), 0..3),
            prop::collection::vec(beat_update(), 0..3),
        );
        let creations = (
            prop::collection::vec(pick(CHARACTERS), 0..3),
            prop::collection::vec(pick(LOCATIONS), 0..2),
            prop::collection::vec(pick(ITEMS), 0..2),
            prop::collection::vec(pick(BEATS), 0..2),
        );
        let scene = (
            prop::option::of(pick(LOCATIONS)),
            pick(&["none", "minutes", "hours", "days", ""]),
        );

        (updates, creations, scene).prop_map(
            |((cu, lu, iu, bu), (nc, nl, ni, nb), (location, time))| ClassificationResult {
                entry_updates: EntryUpdates {
                    character_updates: cu,
                    location_updates: lu,
                    item_updates: iu,
                    story_beat_updates: bu,
                    new_characters: nc
                        .into_iter()
                        .map(|name| NewCharacter {
                            name,
                            ..Default::default()
                        })
                        .collect(),
                    new_locations: nl
                        .into_iter()
                        .map(|name| NewLocation {
                            name,
                            ..Default::default()
                        })
                        .collect(),
                    new_items: ni
                        .into_iter()
                        .map(|name| NewItem {
                            name,
                            ..Default::default()
                        })
                        .collect(),
                    new_story_beats: nb
                        .into_iter()
                        .map(|title| NewStoryBeat {
                            title,
                            beat_type: "quest".to_string(),
                            ..Default::default()
                        })
                        .collect(),
                },
                scene: SceneUpdate {
                    current_location_name: location,
                    present_character_names: Vec::new(),
                    time_progression: time.to_string(),
                },
            },
        )
    }

    /// 预置部分实体：池中靠前的名字已存在，靠后的名字只能由分类新建
    async fn seeded_store(scope: &StoryScope) -> Arc<InMemoryWorldStore> {
        let store = Arc::new(InMemoryWorldStore::new());
        for name in &CHARACTERS[..3] {
            let mut c = Character::new(scope, *name);
            c.traits = vec!["tired".to_string()];
            store.add_character(scope, c).await.unwrap();
        }
        let mut docks = Location::new(scope, "Docks");
        docks.current = true;
        docks.visited = true;
        let docks_id = docks.id.clone();
        store.add_location(scope, docks).await.unwrap();
        store.add_location(scope, Location::new(scope, "Inn")).await.unwrap();
        for name in &ITEMS[..2] {
            store.add_item(scope, Item::new(scope, *name)).await.unwrap();
        }
        store
            .add_story_beat(scope, StoryBeat::new(scope, BEATS[0], Utc::now()))
            .await
            .unwrap();

        let mut env = store.environment(scope).await.unwrap();
        env.current_location_id = Some(docks_id);
        store.set_environment(scope, env).await.unwrap();
        store
            .add_entry(StoryEntry::new(scope, 0, EntryType::UserAction, "begin"))
            .await
            .unwrap();
        store
    }

    /// 应用 → 逆转，返回 (应用前, 逆转后, 逆转是否全部成功)
    fn apply_and_revert(result: &ClassificationResult) -> (WorldView, WorldView, bool) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let scope = StoryScope::main("prop");
            let store = seeded_store(&scope).await;
            let before = store.world_view(&scope).await.unwrap();

            let entry = StoryEntry::new(&scope, 1, EntryType::Narration, "something happens");
            let entry_id = entry.id.clone();
            store.add_entry(entry).await.unwrap();
            let outcome = ClassificationApplier::apply(store.as_ref(), &scope, result)
                .await
                .unwrap();
            store
                .set_entry_delta(&scope, &entry_id, Some(outcome.delta))
                .await
                .unwrap();

            let summary = RollbackEngine::new(store.clone()).rollback_to(&scope, 1).await;
            let after = store.world_view(&scope).await.unwrap();
            (before, after, summary.is_complete())
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]

        #[test]
        fn applying_then_reverting_restores_world(result in classification()) {
            let (before, after, complete) = apply_and_revert(&result);
            prop_assert!(complete);
            prop_assert_eq!(before, after);
        }
    }
}
