//! Migration history of the media server store.
//!
//! Append new migrations at the end with a later id. Never edit one that has
//! shipped.

use schemaflow_common::Result;
use schemaflow_db::{
    ColumnDef, DataOp, ForeignKey, Idempotency, Invertibility, MigrationDefinition,
    MigrationRegistry, ReferentialAction, SchemaOp,
};

pub fn registry() -> Result<MigrationRegistry> {
    MigrationRegistry::new(vec![
        initial()?,
        add_block()?,
        rename_media_item_path()?,
        add_playout_seed()?,
        add_playout_history()?,
        reset_playout_items()?,
        fix_duplicate_names()?,
        update_case_sensitivity()?,
    ])
}

fn fk(column: &str, table: &str) -> ForeignKey {
    ForeignKey::new(column, table, "Id", ReferentialAction::Cascade)
}

fn initial() -> Result<MigrationDefinition> {
    Ok(MigrationDefinition::new("20210212105010_Initial")?
        .up(SchemaOp::create_table(
            "Channel",
            vec![
                ColumnDef::id("Id"),
                ColumnDef::new("Number", "TEXT").not_null().default_value("''"),
                ColumnDef::new("Name", "TEXT"),
                ColumnDef::new("StreamingMode", "INTEGER")
                    .not_null()
                    .default_value("1"),
            ],
            vec![],
        ))
        .up(SchemaOp::create_unique_index(
            "IX_Channel_Number",
            "Channel",
            &["Number"],
        ))
        .up(SchemaOp::create_table(
            "MediaItem",
            vec![
                ColumnDef::id("Id"),
                ColumnDef::new("Path", "TEXT").not_null().default_value("''"),
            ],
            vec![],
        ))
        .up(SchemaOp::create_table(
            "ProgramSchedule",
            vec![ColumnDef::id("Id"), ColumnDef::new("Name", "TEXT")],
            vec![],
        ))
        .up(SchemaOp::create_table(
            "Playout",
            vec![
                ColumnDef::id("Id"),
                ColumnDef::new("ChannelId", "INTEGER").not_null(),
                ColumnDef::new("ProgramScheduleId", "INTEGER").not_null(),
            ],
            vec![fk("ChannelId", "Channel"), fk("ProgramScheduleId", "ProgramSchedule")],
        ))
        .up(SchemaOp::create_index("IX_Playout_ChannelId", "Playout", &["ChannelId"]))
        .up(SchemaOp::create_table(
            "PlayoutItem",
            vec![
                ColumnDef::id("Id"),
                ColumnDef::new("PlayoutId", "INTEGER").not_null(),
                ColumnDef::new("MediaItemId", "INTEGER").not_null(),
                ColumnDef::new("StartUtc", "TEXT").not_null(),
                ColumnDef::new("FinishUtc", "TEXT").not_null(),
            ],
            vec![fk("PlayoutId", "Playout"), fk("MediaItemId", "MediaItem")],
        ))
        .up(SchemaOp::create_index(
            "IX_PlayoutItem_PlayoutId",
            "PlayoutItem",
            &["PlayoutId"],
        ))
        .down(SchemaOp::drop_table("PlayoutItem"))
        .down(SchemaOp::drop_table("Playout"))
        .down(SchemaOp::drop_table("ProgramSchedule"))
        .down(SchemaOp::drop_table("MediaItem"))
        .down(SchemaOp::drop_table("Channel")))
}

fn add_block() -> Result<MigrationDefinition> {
    Ok(MigrationDefinition::new("20240110162335_Add_Block")?
        .up(SchemaOp::create_table(
            "BlockGroup",
            vec![ColumnDef::id("Id"), ColumnDef::new("Name", "TEXT")],
            vec![],
        ))
        .up(SchemaOp::create_table(
            "Block",
            vec![
                ColumnDef::id("Id"),
                ColumnDef::new("BlockGroupId", "INTEGER").not_null(),
                ColumnDef::new("Name", "TEXT"),
                ColumnDef::new("Minutes", "INTEGER").not_null().default_value("0"),
            ],
            vec![fk("BlockGroupId", "BlockGroup")],
        ))
        .up(SchemaOp::create_index("IX_Block_BlockGroupId", "Block", &["BlockGroupId"]))
        .down(SchemaOp::drop_table("Block"))
        .down(SchemaOp::drop_table("BlockGroup")))
}

fn rename_media_item_path() -> Result<MigrationDefinition> {
    Ok(MigrationDefinition::new("20240211135444_Rename_MediaItem_Path")?
        .up(SchemaOp::rename_column("MediaItem", "Path", "FilePath"))
        .down(SchemaOp::rename_column("MediaItem", "FilePath", "Path")))
}

fn add_playout_seed() -> Result<MigrationDefinition> {
    Ok(MigrationDefinition::new("20240719161128_Add_Playout_Seed")?
        .up(SchemaOp::add_column(
            "Playout",
            ColumnDef::new("Seed", "INTEGER").not_null().default_value("0"),
        ))
        .up(DataOp::backfill(
            "give existing playouts a random shuffle seed",
            "UPDATE Playout SET Seed = abs(random() % 2147483647) WHERE Seed = 0",
            Invertibility::Invertible,
        ))
        .down(SchemaOp::drop_column("Playout", "Seed")))
}

fn add_playout_history() -> Result<MigrationDefinition> {
    Ok(MigrationDefinition::new("20250914145922_Add_PlayoutHistory")?
        .up(SchemaOp::create_table(
            "PlayoutHistory",
            vec![
                ColumnDef::new("PlayoutId", "INTEGER").primary_key(),
                ColumnDef::new("Key", "TEXT").primary_key(),
                ColumnDef::new("WhenUtc", "TEXT").not_null().default_value("''"),
                ColumnDef::new("Details", "TEXT"),
            ],
            vec![fk("PlayoutId", "Playout")],
        ))
        .down(SchemaOp::drop_table("PlayoutHistory")))
}

fn reset_playout_items() -> Result<MigrationDefinition> {
    Ok(MigrationDefinition::new("20250918180429_Reset_PlayoutItems")?
        .named("Reset playout items after history tracking")
        .up(DataOp::invalidate_derived(
            "remove generated playout items so playouts are rebuilt with history",
            "DELETE FROM PlayoutItem",
        )))
}

fn fix_duplicate_names() -> Result<MigrationDefinition> {
    let dedupe = |table: &str| {
        format!(
            "WITH Numbered AS (
                SELECT Id,
                       ROW_NUMBER() OVER (PARTITION BY Name COLLATE NOCASE ORDER BY Id) AS RowNum
                FROM {table}
            )
            UPDATE {table}
            SET Name = Name || ' (' || (Numbered.RowNum - 1) || ')'
            FROM Numbered
            WHERE {table}.Id = Numbered.Id
              AND Numbered.RowNum > 1"
        )
    };

    Ok(MigrationDefinition::new("20260102144811_Fix_DuplicateNames")?
        .up(DataOp::remap(
            "suffix block names that differ only by case",
            dedupe("Block"),
            Invertibility::Lossy,
            Idempotency::Idempotent,
        ))
        .up(DataOp::remap(
            "suffix block group names that differ only by case",
            dedupe("BlockGroup"),
            Invertibility::Lossy,
            Idempotency::Idempotent,
        )))
}

fn update_case_sensitivity() -> Result<MigrationDefinition> {
    Ok(MigrationDefinition::new("20260102150221_Update_CaseSensitivity")?
        .up(SchemaOp::alter_column(
            "Block",
            ColumnDef::new("Name", "TEXT").collate("NOCASE"),
        ))
        .up(SchemaOp::alter_column(
            "BlockGroup",
            ColumnDef::new("Name", "TEXT").collate("NOCASE"),
        ))
        .up(SchemaOp::create_unique_index("IX_Block_Name", "Block", &["Name"]))
        .up(SchemaOp::create_unique_index(
            "IX_BlockGroup_Name",
            "BlockGroup",
            &["Name"],
        ))
        .down(SchemaOp::drop_index("IX_BlockGroup_Name"))
        .down(SchemaOp::drop_index("IX_Block_Name"))
        .down(SchemaOp::alter_column("BlockGroup", ColumnDef::new("Name", "TEXT")))
        .down(SchemaOp::alter_column("Block", ColumnDef::new("Name", "TEXT"))))
}

#[cfg(test)]
mod tests {
    use super::*;
    use schemaflow_common::MigrationId;
    use schemaflow_config::AppConfig;
    use schemaflow_db::{MigrationRunner, open_in_memory_store};

    #[test]
    fn catalog_is_valid_and_ordered() {
        let registry = registry().unwrap();
        assert_eq!(registry.len(), 8);
        assert_eq!(
            registry.latest().unwrap().id().as_str(),
            "20260102150221_Update_CaseSensitivity"
        );
        assert!(
            registry
                .lookup(&MigrationId::parse("20250918180429_Reset_PlayoutItems").unwrap())
                .unwrap()
                .is_lossy()
        );
    }

    #[test]
    fn applies_to_an_empty_store_and_dedupes_names() {
        let registry = registry().unwrap();
        let config = AppConfig::default();
        let runner = MigrationRunner::new(&registry, &config);
        let mut conn = open_in_memory_store(&config.database).unwrap();

        let before_names = MigrationId::parse("20250918180429_Reset_PlayoutItems").unwrap();
        runner.apply_pending_to(&mut conn, Some(&before_names)).unwrap();
        conn.execute_batch(
            "INSERT INTO BlockGroup (Id, Name) VALUES (1, 'Weekday');
             INSERT INTO Block (Id, BlockGroupId, Name) VALUES
                (1, 1, 'Morning'), (2, 1, 'morning'), (3, 1, 'Evening');",
        )
        .unwrap();

        let report = runner.apply_pending(&mut conn).unwrap();
        assert_eq!(report.migrations.len(), 2);
        assert!(runner.status(&conn).unwrap().is_up_to_date());

        let renamed: String = conn
            .query_row("SELECT Name FROM Block WHERE Id = 2", [], |r| r.get(0))
            .unwrap();
        assert_eq!(renamed, "morning (1)");

        // NOCASE now applies to lookups.
        let found: i64 = conn
            .query_row("SELECT Id FROM Block WHERE Name = 'EVENING'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(found, 3);
    }

    #[test]
    fn full_rollback_returns_to_an_empty_schema() {
        let registry = registry().unwrap();
        let config = AppConfig::default();
        let mut conn = open_in_memory_store(&config.database).unwrap();

        let runner = MigrationRunner::new(&registry, &config);
        let empty = runner.snapshot(&conn).unwrap();
        runner.apply_pending(&mut conn).unwrap();

        let runner = runner.allow_lossy_rollback(true);
        let report = runner.rollback(&mut conn, usize::MAX).unwrap();
        assert_eq!(report.migrations.len(), registry.len());
        assert_eq!(runner.snapshot(&conn).unwrap(), empty);
    }
}
