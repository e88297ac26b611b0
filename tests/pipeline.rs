//! End-to-end pipeline tests: literal log lines in, persisted state and
//! WebSocket frames out.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use farmtrack_backend::config::Config;
use farmtrack_backend::events::{EventBus, ParserEvent};
use farmtrack_backend::items::ItemCatalog;
use farmtrack_backend::maps::MapTable;
use farmtrack_backend::parsing::ParserRegistry;
use farmtrack_backend::prices::PriceBook;
use farmtrack_backend::services::broadcaster::BroadcastService;
use farmtrack_backend::services::session::SessionService;
use farmtrack_backend::services::stats::StatsService;
use farmtrack_backend::services::{builtin_services, Service, ServiceContainer, ServiceContext};
use farmtrack_backend::storage::Database;

struct Harness {
    _dir: tempfile::TempDir,
    ctx: ServiceContext,
}

async fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let base = dir.path();

    std::fs::write(
        base.join("config.toml"),
        r#"
[parser]
log_path = "/tmp/farmtrack-test-game.log"

[inventory]
update_interval = 0.0

[stats]
snapshot_interval = 0.0
"#,
    )
    .unwrap();
    std::fs::write(
        base.join("price_table.json"),
        r#"{
            "5028": {"name": "Flux Crystal", "category": "currency", "price": 2.5},
            "9000": {"name": "Sealed Writ", "category": "key", "price": 4.0},
            "42": {"name": "Ember Shard", "category": "material", "price": 1.0},
            "99": {"name": "Pale Relic", "category": "material", "price": 3.0}
        }"#,
    )
    .unwrap();
    std::fs::write(
        base.join("map_table.json"),
        r#"{"5302": {"name": "Grimwind Woods", "asset": "XZ_GW", "area": "Glacial Abyss", "difficulty": "T7_0"}}"#,
    )
    .unwrap();
    std::fs::write(
        base.join("experience.json"),
        r#"{"levels": [[{"Id": 1, "Exp": 1000}, {"Id": 49, "Exp": 20000}, {"Id": 50, "Exp": 25000}]]}"#,
    )
    .unwrap();

    let config = Arc::new(Config::load(&base.join("config.toml")).unwrap());
    let db = Arc::new(Database::open(&config.database_path()).unwrap());
    let catalog = Arc::new(ItemCatalog::load(&config.price_table_path()));
    let maps = Arc::new(MapTable::load(&config.map_table_path()).unwrap());
    let bus = Arc::new(EventBus::new());
    let broadcaster = Arc::new(BroadcastService::new());

    let prices = Arc::new(
        PriceBook::new(
            Arc::clone(&db),
            Arc::clone(&catalog),
            None,
            config.price_table_path(),
        )
        .unwrap(),
    );
    prices.register(&bus);
    prices.refresh().await.unwrap();

    let ctx = ServiceContext {
        bus,
        db,
        prices,
        catalog,
        maps,
        config,
        broadcaster,
    };
    Harness { _dir: dir, ctx }
}

fn line(body: &str) -> String {
    format!("[2025.12.10-15.30.45:123][456]GameLog: Display: [Game] {body}")
}

async fn feed(registry: &mut ParserRegistry, lines: &[String]) {
    for l in lines {
        registry.feed_line(l);
    }
    // Let the drain/publish pipeline run dry.
    tokio::time::sleep(Duration::from_millis(400)).await;
}

fn message_types(frames: &mut tokio::sync::mpsc::UnboundedReceiver<String>) -> HashSet<String> {
    let mut types = HashSet::new();
    while let Ok(frame) = frames.try_recv() {
        let json: serde_json::Value = serde_json::from_str(&frame).unwrap();
        types.insert(json["type"].as_str().unwrap().to_string());
    }
    types
}

#[tokio::test]
async fn basic_map_run_records_completion() {
    let h = harness().await;
    let container = ServiceContainer::start(&h.ctx, builtin_services()).await;
    let (_client, mut frames) = h.ctx.broadcaster.register_client();
    let mut registry = ParserRegistry::spawn(
        Arc::clone(&h.ctx.bus),
        &h.ctx.catalog,
        &h.ctx.maps,
        None,
    );

    let lines = vec![
        line("SwitchBattleAreaUtil:_JoinFight Eryndor#7291:1100"),
        line("LevelMgr@ EnterLevel"),
        line("LevelMgr@ LevelUid, LevelType, LevelId = 1121002 3 5302"),
        line("LevelMgr@:LevelPath, Model = /Game/Art/Maps/XZ_GW SomeModel"),
        line("ItemChange@ Add Id=5028_50acee19-c8e1-11f0-8ac6-000000000015 BagNum=1 in PageId=102 SlotId=21"),
        line("ItemChange@ Update Id=5028_50acee19-c8e1-11f0-8ac6-000000000015 BagNum=2 in PageId=102 SlotId=21"),
        line("ItemChange@ Update Id=5028_50acee19-c8e1-11f0-8ac6-000000000015 BagNum=3 in PageId=102 SlotId=21"),
        line("UGameMgr::ExitLevel()"),
    ];
    feed(&mut registry, &lines).await;

    // Exactly one session, active, for the joining player.
    let sessions = h.ctx.db.list_sessions(10, 0).unwrap();
    assert_eq!(sessions.len(), 1);
    assert!(sessions[0].is_active);
    assert_eq!(sessions[0].player_name.as_deref(), Some("Eryndor#7291"));

    // One completion: 3 crystals at 2.5 each, no entry cost.
    let completions = h.ctx.db.list_map_completions(10, 0, None).unwrap();
    assert_eq!(completions.len(), 1);
    let completion = &completions[0];
    assert_eq!(completion.map_id, 5302);
    assert_eq!(completion.map_name.as_deref(), Some("Grimwind Woods"));
    assert_eq!(completion.map_difficulty.as_deref(), Some("T7_0"));
    assert_eq!(completion.session_id, Some(sessions[0].id));
    assert!(completion.duration >= 0.0);
    assert!((completion.currency_gained - 3.0 * 2.5).abs() < 1e-6);
    assert_eq!(completion.items_gained, 1);

    let items = h.ctx.db.map_completion_items(completion.id).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].item_id, 5028);
    assert_eq!(items[0].delta, 3);
    assert!(!items[0].consumed);

    // currency_gained reconciles with the item rows.
    let gains: f64 = items
        .iter()
        .filter(|i| !i.consumed)
        .map(|i| i.total_price)
        .sum();
    let costs: f64 = items.iter().filter(|i| i.consumed).map(|i| i.total_price).sum();
    assert!((completion.currency_gained - (gains + costs)).abs() < 1e-6);

    let types = message_types(&mut frames);
    for expected in [
        "player_join",
        "session_started",
        "map_started",
        "map_finished",
        "map_record",
        "stats_update",
    ] {
        assert!(types.contains(expected), "missing ws frame: {expected}");
    }

    registry.shutdown().await;
    container.shutdown().await;
}

#[tokio::test]
async fn entry_cost_is_recorded_as_consumed_items() {
    let h = harness().await;
    let container = ServiceContainer::start(&h.ctx, builtin_services()).await;
    let mut registry = ParserRegistry::spawn(
        Arc::clone(&h.ctx.bus),
        &h.ctx.catalog,
        &h.ctx.maps,
        None,
    );

    let lines = vec![
        line("SwitchBattleAreaUtil:_JoinFight Eryndor#7291:1100"),
        // Two writs on hand when the map selection UI opens.
        line("ItemChange@ Add Id=9000_3dc0c281-ba2e-11f0-b761-000000000174 BagNum=2 in PageId=102 SlotId=1"),
        line("PageStack@ CurRunView = 2215_MysteryAreaCtrl"),
        // One writ is consumed opening the map.
        line("ItemChange@ Update Id=9000_3dc0c281-ba2e-11f0-b761-000000000174 BagNum=1 in PageId=102 SlotId=1"),
        line("LevelMgr@ EnterLevel"),
        line("LevelMgr@ LevelUid, LevelType, LevelId = 1121002 3 5302"),
        line("LevelMgr@:LevelPath, Model = /Game/Art/Maps/XZ_GW SomeModel"),
        line("UGameMgr::ExitLevel()"),
    ];
    feed(&mut registry, &lines).await;

    let completions = h.ctx.db.list_map_completions(10, 0, None).unwrap();
    assert_eq!(completions.len(), 1);

    let items = h.ctx.db.map_completion_items(completions[0].id).unwrap();
    let consumed: Vec<_> = items.iter().filter(|i| i.consumed).collect();
    assert_eq!(consumed.len(), 1);
    assert_eq!(consumed[0].item_id, 9000);
    assert_eq!(consumed[0].delta, -1);
    assert!((consumed[0].total_price - (-4.0)).abs() < 1e-6);

    registry.shutdown().await;
    container.shutdown().await;
}

#[tokio::test]
async fn market_batches_same_item_and_flushes_on_switch() {
    let h = harness().await;
    let container = ServiceContainer::start(&h.ctx, builtin_services()).await;
    let mut registry = ParserRegistry::spawn(
        Arc::clone(&h.ctx.bus),
        &h.ctx.catalog,
        &h.ctx.maps,
        None,
    );

    let lines = vec![
        line("SwitchBattleAreaUtil:_JoinFight Eryndor#7291:1100"),
        line("PageStack@ CurRunView = 2501_AuctionHouseCtrl"),
        // Six changes on item 42, netting +5 across two slots.
        line("ItemChange@ Add Id=42_aaa BagNum=2 in PageId=102 SlotId=21"),
        line("ItemChange@ Update Id=42_aaa BagNum=5 in PageId=102 SlotId=21"),
        line("ItemChange@ Delete Id=42_aaa in PageId=102 SlotId=21"),
        line("ItemChange@ Add Id=42_aaa BagNum=5 in PageId=102 SlotId=22"),
        line("ItemChange@ Update Id=42_aaa BagNum=5 in PageId=102 SlotId=22"),
        line("ItemChange@ Update Id=42_aaa BagNum=5 in PageId=102 SlotId=22"),
        // Different item: the 42-batch flushes, 99 starts its own.
        line("ItemChange@ Add Id=99_bbb BagNum=1 in PageId=102 SlotId=30"),
        // Market closes: the pending 99-batch flushes too.
        line("PageStack@ CurRunView = 1321_FightCtrl"),
    ];
    feed(&mut registry, &lines).await;

    let transactions = h.ctx.db.list_market_transactions(10, 0, None).unwrap();
    assert_eq!(transactions.len(), 2);

    // Listing is newest-first.
    let first = transactions.iter().find(|t| t.item_id == 42).unwrap();
    assert_eq!(first.quantity, 5);
    assert_eq!(first.action, "gained");
    let second = transactions.iter().find(|t| t.item_id == 99).unwrap();
    assert_eq!(second.quantity, 1);
    assert_eq!(second.action, "gained");

    registry.shutdown().await;
    container.shutdown().await;
}

#[tokio::test]
async fn active_session_is_restored_into_stats() {
    let h = harness().await;

    // A previous run left an active session behind.
    let player = h.ctx.db.touch_player("Eryndor#7291").unwrap();
    let mut session = h
        .ctx
        .db
        .create_session(player.id, &player.name, farmtrack_backend::events::now())
        .unwrap();
    session.total_maps = 7;
    session.total_time = 1800.0;
    session.currency_total = 42.0;
    h.ctx.db.save_session(&session).unwrap();

    let session_service = Arc::new(SessionService::new(&h.ctx));
    let stats_service = Arc::new(StatsService::new(&h.ctx));
    let (_client, mut frames) = h.ctx.broadcaster.register_client();

    Arc::clone(&session_service).register(&h.ctx.bus);
    Arc::clone(&stats_service).register(&h.ctx.bus);
    Arc::clone(&h.ctx.broadcaster).register(&h.ctx.bus);

    session_service.post_startup().await.unwrap();

    let stats = stats_service.get_stats();
    assert_eq!(stats.total_maps, 7);
    assert_eq!(stats.total_time, 1800.0);
    assert_eq!(stats.currency_total, 42.0);

    let types = message_types(&mut frames);
    assert!(types.contains("session_restore"));
}

#[tokio::test]
async fn level_loss_counts_as_exp_lost() {
    let h = harness().await;
    let stats_service = Arc::new(StatsService::new(&h.ctx));
    Arc::clone(&stats_service).register(&h.ctx.bus);

    // Seed, then die with a level loss.
    h.ctx.bus.publish(exp_update(50, 9000)).await;
    h.ctx.bus.publish(exp_update(49, 8500)).await;

    let stats = stats_service.get_stats();
    assert_eq!(stats.exp_lost_total, 500.0);
    assert_eq!(stats.exp_gained_total, 0.0);
}

#[tokio::test]
async fn db_loaded_inventory_does_not_count_toward_rates() {
    use farmtrack_backend::events::parser::GameViewEvent;
    use farmtrack_backend::events::service::{InventorySnapshotEvent, InventoryUpdateEvent};
    use farmtrack_backend::events::{Event, ServiceEvent};
    use farmtrack_backend::services::model::{Inventory, InventorySnapshot};

    let h = harness().await;
    let stats_service = Arc::new(StatsService::new(&h.ctx));
    Arc::clone(&stats_service).register(&h.ctx.bus);

    let mut loaded = Inventory::new();
    loaded.change_item(102, 21, 5028, 100, None, None);

    // Inventory arrives from the database, then the combat view opens.
    h.ctx
        .bus
        .publish(Event::Service(ServiceEvent::InventoryUpdate(
            InventoryUpdateEvent {
                timestamp: farmtrack_backend::events::now(),
                inventory: loaded.clone(),
            },
        )))
        .await;
    h.ctx
        .bus
        .publish(Event::Parser(ParserEvent::GameView(GameViewEvent {
            timestamp: farmtrack_backend::events::now(),
            view: "1321_FightCtrl".to_string(),
        })))
        .await;

    // A snapshot identical to the loaded inventory must not register the
    // 100 stored crystals as drops.
    h.ctx
        .bus
        .publish(Event::Service(ServiceEvent::InventorySnapshot(
            InventorySnapshotEvent {
                timestamp: farmtrack_backend::events::now(),
                snapshot: InventorySnapshot::from_inventory(&loaded),
            },
        )))
        .await;
    assert_eq!(stats_service.get_stats().currency_total, 0.0);

    // Real pickups on top of the baseline do count.
    let mut richer = loaded.clone();
    richer.change_item(102, 21, 5028, 102, None, None);
    h.ctx
        .bus
        .publish(Event::Service(ServiceEvent::InventorySnapshot(
            InventorySnapshotEvent {
                timestamp: farmtrack_backend::events::now(),
                snapshot: InventorySnapshot::from_inventory(&richer),
            },
        )))
        .await;
    let stats = stats_service.get_stats();
    assert!((stats.currency_total - 2.0 * 2.5).abs() < 1e-6);
}

fn exp_update(level: i64, experience: i64) -> farmtrack_backend::events::Event {
    farmtrack_backend::events::Event::Parser(ParserEvent::ExpUpdate(
        farmtrack_backend::events::parser::ExpUpdateEvent {
            timestamp: farmtrack_backend::events::now(),
            experience,
            level,
        },
    ))
}
