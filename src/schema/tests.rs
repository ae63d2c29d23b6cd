use super::*;

fn user_schema() -> EntitySchema {
    EntitySchema::builder("UserEntity")
        .entity_tags("crud-stream;local-cache")
        .column(Column::varchar("Name", 100).tags("unique=NameCountry"))
        .column(Column::varchar("Country", 64).tags("unique=NameCountry:2;skip-crud-stream"))
        .column(Column::uint("Age", IntSize::Tiny).tags("index=Age"))
        .column(Column::enumeration("Color", ["red", "green"]).tags("required"))
        .column(Column::reference("Owner", "OwnerEntity"))
        .build()
        .unwrap()
}

#[test]
fn test_id_column_first() {
    let schema = user_schema();
    assert_eq!(
        schema.columns(),
        vec!["ID", "Name", "Country", "Age", "Color", "Owner"]
    );
    assert_eq!(schema.table(), "UserEntity");
    assert_eq!(schema.pool(), DEFAULT_POOL);
}

#[test]
fn test_references() {
    assert_eq!(user_schema().references(), vec!["Owner"]);
}

#[test]
fn test_indexes_from_tags() {
    let schema = user_schema();
    let indexes = schema.indexes();
    assert_eq!(
        indexes[0],
        IndexDefinition::new(
            "NameCountry",
            vec!["Name".to_string(), "Country".to_string()],
            true
        )
    );
    assert_eq!(indexes[1], IndexDefinition::new("Age", vec!["Age".to_string()], false));
    assert_eq!(indexes[2], IndexDefinition::new("Owner", vec!["Owner".to_string()], false));
}

#[test]
fn test_entity_tags() {
    let schema = user_schema();
    assert!(schema.has_entity_tag("crud-stream"));
    assert_eq!(schema.get_entity_tag("crud-stream", "true", "false"), "true");
    assert_eq!(schema.get_tag("Country", "skip-crud-stream", "true", "false"), "true");
    assert_eq!(schema.local_cache(), Some(DEFAULT_POOL));
}

#[test]
fn test_duplicate_column_rejected() {
    let err = EntitySchema::builder("Broken")
        .column(Column::varchar("Name", 10))
        .column(Column::text("Name"))
        .build()
        .unwrap_err();
    assert!(matches!(err, OrmError::Validation(_)));
}

#[test]
fn test_mixed_unique_and_plain_index_rejected() {
    let err = EntitySchema::builder("Broken")
        .column(Column::varchar("A", 10).tags("index=AB"))
        .column(Column::varchar("B", 10).tags("unique=AB:2"))
        .build()
        .unwrap_err();
    assert!(matches!(err, OrmError::Validation(_)));
}

#[test]
fn test_table_definition_dialect_8() {
    let table = user_schema().table_definition();
    let defs: Vec<(&str, &str)> = table
        .columns
        .iter()
        .map(|c| (c.name.as_str(), c.definition.as_str()))
        .collect();
    assert_eq!(
        defs,
        vec![
            ("ID", "bigint unsigned NOT NULL AUTO_INCREMENT"),
            ("Name", "varchar(100) DEFAULT NULL"),
            ("Country", "varchar(64) DEFAULT NULL"),
            ("Age", "tinyint unsigned NOT NULL DEFAULT '0'"),
            ("Color", "enum('red','green') NOT NULL"),
            ("Owner", "bigint unsigned DEFAULT NULL"),
        ]
    );
    assert_eq!(table.primary_key, vec!["ID".to_string()]);
}

#[test]
fn test_table_definition_dialect_5_widths() {
    let mut schema = user_schema();
    schema.set_dialect_version(5);
    let table = schema.table_definition();
    assert_eq!(
        table.column("ID").unwrap().definition,
        "bigint(20) unsigned NOT NULL AUTO_INCREMENT"
    );
    assert_eq!(
        table.column("Age").unwrap().definition,
        "tinyint(3) unsigned NOT NULL DEFAULT '0'"
    );
}

#[test]
fn test_bool_and_decimal_definitions() {
    assert_eq!(Column::bool("Active").sql_definition(8), "tinyint(1) NOT NULL DEFAULT '0'");
    assert_eq!(
        Column::decimal("Price", 10, 2).sql_definition(8),
        "decimal(10,2) NOT NULL DEFAULT '0.00'"
    );
    assert_eq!(Column::text("Body").sql_definition(8), "text");
    assert_eq!(Column::json("Data").sql_definition(8), "json DEFAULT NULL");
    assert_eq!(
        Column::varchar("Code", 8).tags("required").sql_definition(8),
        "varchar(8) NOT NULL DEFAULT ''"
    );
}

#[test]
fn test_plugin_options_typed() {
    let mut schema = user_schema();
    schema.set_plugin_option("test/plugin", "limit", 5usize);
    assert_eq!(schema.plugin_option::<usize>("test/plugin", "limit"), Some(&5));
    assert_eq!(schema.plugin_option::<String>("test/plugin", "limit"), None);
    assert_eq!(schema.plugin_option::<usize>("other", "limit"), None);
}

#[test]
fn test_validate_choices() {
    let schema = user_schema();
    assert!(schema
        .validate_choices(&Bind::new().with("Color", "red").with("Name", "x"))
        .is_ok());
    let err = schema
        .validate_choices(&Bind::new().with("Color", "blue"))
        .unwrap_err();
    assert!(matches!(err, OrmError::EnumUnknown { ref field, ref value } if field == "Color" && value == "blue"));
    let err = schema
        .validate_choices(&Bind::new().with_null("Color"))
        .unwrap_err();
    assert!(matches!(err, OrmError::EnumUnknown { .. }));
}

#[test]
fn test_validate_set_values() {
    let schema = EntitySchema::builder("Tagged")
        .column(Column::set("Flags", ["a", "b"]))
        .build()
        .unwrap();
    assert!(schema.validate_choices(&Bind::new().with("Flags", "a,b")).is_ok());
    assert!(schema.validate_choices(&Bind::new().with_null("Flags")).is_ok());
    assert!(schema.validate_choices(&Bind::new().with("Flags", "a,c")).is_err());
}
