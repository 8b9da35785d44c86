//! Declarative analytics schema.
//!
//! Table and column names are compile-time constants forming the stable
//! on-disk contract that patches key off. The [`TableSpec`]s declared here
//! are rendered to dialect-specific DDL by the `dialect` builder at first
//! enable; nothing else in the crate emits `CREATE TABLE` text.

use crate::dialect::{CreateTableBuilder, Dialect};
use crate::error::Result;

// ------------- Name constants -------------

pub mod users {
    pub const TABLE: &str = "tally_users";
    pub const ID: &str = "id";
    pub const UUID: &str = "uuid";
    pub const NAME: &str = "name";
    pub const REGISTERED_MS: &str = "registered_ms";
}

pub mod servers {
    pub const TABLE: &str = "tally_servers";
    pub const ID: &str = "id";
    pub const UUID: &str = "uuid";
    pub const NAME: &str = "name";
    pub const INSTALLED: &str = "installed";
}

pub mod user_server {
    pub const TABLE: &str = "tally_user_server";
    pub const ID: &str = "id";
    pub const USER_ID: &str = "user_id";
    pub const SERVER_ID: &str = "server_id";
    pub const REGISTERED_MS: &str = "registered_ms";
    pub const BANNED: &str = "banned";
}

pub mod sessions {
    pub const TABLE: &str = "tally_sessions";
    pub const ID: &str = "id";
    pub const USER_ID: &str = "user_id";
    pub const SERVER_ID: &str = "server_id";
    pub const START_MS: &str = "session_start_ms";
    pub const END_MS: &str = "session_end_ms";
    pub const AFK_MS: &str = "afk_ms";
}

pub mod tps {
    pub const TABLE: &str = "tally_tps_samples";
    pub const ID: &str = "id";
    pub const SERVER_ID: &str = "server_id";
    pub const DATE_MS: &str = "date_ms";
    pub const TPS: &str = "tps";
    pub const PLAYERS_ONLINE: &str = "players_online";
}

pub mod ping {
    pub const TABLE: &str = "tally_ping_samples";
    pub const ID: &str = "id";
    pub const USER_ID: &str = "user_id";
    pub const SERVER_ID: &str = "server_id";
    pub const DATE_MS: &str = "date_ms";
    pub const MIN_MS: &str = "min_ms";
    pub const MAX_MS: &str = "max_ms";
    pub const AVG_MS: &str = "avg_ms";
}

pub mod settings {
    pub const TABLE: &str = "tally_settings";
    pub const KEY: &str = "setting_key";
    pub const VALUE: &str = "setting_value";
    pub const UPDATED_MS: &str = "updated_ms";
}

/// Obsolete version-counter table dropped by a patch; old releases wrote
/// their migration level here before probes replaced counters.
pub const LEGACY_VERSION_TABLE: &str = "tally_schema_version";

// ------------- Column and table specs -------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Int,
    Long,
    Double,
    Bool,
    Varchar(u16),
    Text,
}

impl ColumnType {
    /// Engine-native spelling. The two engines agree on everything the
    /// schema uses, so this is dialect-neutral by construction.
    pub fn sql(&self) -> String {
        match self {
            Self::Int => "integer".into(),
            Self::Long => "bigint".into(),
            Self::Double => "double".into(),
            Self::Bool => "boolean".into(),
            Self::Varchar(n) => format!("varchar({n})"),
            Self::Text => "text".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub column_type: ColumnType,
    pub not_null: bool,
    pub unique: bool,
    pub primary_key: bool,
    pub default_value: Option<&'static str>,
}

impl ColumnSpec {
    pub fn new(name: &'static str, column_type: ColumnType) -> Self {
        Self {
            name,
            column_type,
            not_null: false,
            unique: false,
            primary_key: false,
            default_value: None,
        }
    }
    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }
    pub fn default_value(mut self, value: &'static str) -> Self {
        self.default_value = Some(value);
        self
    }
}

/// `(column, referenced table, referenced column)`
pub type ForeignKey = (&'static str, &'static str, &'static str);

#[derive(Debug, Clone)]
pub struct TableSpec {
    pub name: &'static str,
    pub columns: Vec<ColumnSpec>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSpec {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            columns: Vec::new(),
            foreign_keys: Vec::new(),
        }
    }
    pub fn column(mut self, column: ColumnSpec) -> Self {
        self.columns.push(column);
        self
    }
    pub fn foreign_key(
        mut self,
        column: &'static str,
        referenced_table: &'static str,
        referenced_column: &'static str,
    ) -> Self {
        self.foreign_keys
            .push((column, referenced_table, referenced_column));
        self
    }

    /// Render this spec to engine-specific DDL text.
    pub fn render(&self, dialect: Dialect) -> Result<String> {
        let mut builder = CreateTableBuilder::new(self.name, dialect);
        for column in &self.columns {
            builder = builder.column(column.name, &column.column_type.sql());
            if column.primary_key {
                builder = builder.primary_key();
            } else {
                if column.not_null {
                    builder = builder.not_null();
                }
                if column.unique {
                    builder = builder.unique();
                }
                if let Some(default) = column.default_value {
                    builder = builder.default_value(default);
                }
            }
        }
        for (column, referenced_table, referenced_column) in &self.foreign_keys {
            builder = builder.foreign_key(column, referenced_table, referenced_column);
        }
        builder.build()
    }
}

// ------------- The analytics schema -------------

pub fn users_table() -> TableSpec {
    TableSpec::new(users::TABLE)
        .column(ColumnSpec::new(users::ID, ColumnType::Int).primary_key())
        .column(ColumnSpec::new(users::UUID, ColumnType::Varchar(36)).not_null().unique())
        .column(ColumnSpec::new(users::NAME, ColumnType::Varchar(36)).not_null())
        .column(ColumnSpec::new(users::REGISTERED_MS, ColumnType::Long).not_null())
}

pub fn servers_table() -> TableSpec {
    TableSpec::new(servers::TABLE)
        .column(ColumnSpec::new(servers::ID, ColumnType::Int).primary_key())
        .column(ColumnSpec::new(servers::UUID, ColumnType::Varchar(36)).not_null().unique())
        .column(ColumnSpec::new(servers::NAME, ColumnType::Varchar(100)))
        .column(ColumnSpec::new(servers::INSTALLED, ColumnType::Bool).not_null().default_value("1"))
}

pub fn user_server_table() -> TableSpec {
    TableSpec::new(user_server::TABLE)
        .column(ColumnSpec::new(user_server::ID, ColumnType::Int).primary_key())
        .column(ColumnSpec::new(user_server::USER_ID, ColumnType::Int).not_null())
        .column(ColumnSpec::new(user_server::SERVER_ID, ColumnType::Int).not_null())
        .column(ColumnSpec::new(user_server::REGISTERED_MS, ColumnType::Long).not_null())
        .column(ColumnSpec::new(user_server::BANNED, ColumnType::Bool).not_null().default_value("0"))
        .foreign_key(user_server::USER_ID, users::TABLE, users::ID)
        .foreign_key(user_server::SERVER_ID, servers::TABLE, servers::ID)
}

pub fn sessions_table() -> TableSpec {
    TableSpec::new(sessions::TABLE)
        .column(ColumnSpec::new(sessions::ID, ColumnType::Int).primary_key())
        .column(ColumnSpec::new(sessions::USER_ID, ColumnType::Int).not_null())
        .column(ColumnSpec::new(sessions::SERVER_ID, ColumnType::Int).not_null())
        .column(ColumnSpec::new(sessions::START_MS, ColumnType::Long).not_null())
        .column(ColumnSpec::new(sessions::END_MS, ColumnType::Long))
        .column(ColumnSpec::new(sessions::AFK_MS, ColumnType::Long).not_null().default_value("0"))
        .foreign_key(sessions::USER_ID, users::TABLE, users::ID)
        .foreign_key(sessions::SERVER_ID, servers::TABLE, servers::ID)
}

pub fn tps_table() -> TableSpec {
    TableSpec::new(tps::TABLE)
        .column(ColumnSpec::new(tps::ID, ColumnType::Int).primary_key())
        .column(ColumnSpec::new(tps::SERVER_ID, ColumnType::Int).not_null())
        .column(ColumnSpec::new(tps::DATE_MS, ColumnType::Long).not_null())
        .column(ColumnSpec::new(tps::TPS, ColumnType::Double).not_null())
        .column(ColumnSpec::new(tps::PLAYERS_ONLINE, ColumnType::Int).not_null())
        .foreign_key(tps::SERVER_ID, servers::TABLE, servers::ID)
}

pub fn ping_table() -> TableSpec {
    TableSpec::new(ping::TABLE)
        .column(ColumnSpec::new(ping::ID, ColumnType::Int).primary_key())
        .column(ColumnSpec::new(ping::USER_ID, ColumnType::Int).not_null())
        .column(ColumnSpec::new(ping::SERVER_ID, ColumnType::Int).not_null())
        .column(ColumnSpec::new(ping::DATE_MS, ColumnType::Long).not_null())
        .column(ColumnSpec::new(ping::MIN_MS, ColumnType::Int).not_null())
        .column(ColumnSpec::new(ping::MAX_MS, ColumnType::Int).not_null())
        .column(ColumnSpec::new(ping::AVG_MS, ColumnType::Double).not_null())
        .foreign_key(ping::USER_ID, users::TABLE, users::ID)
        .foreign_key(ping::SERVER_ID, servers::TABLE, servers::ID)
}

pub fn settings_table() -> TableSpec {
    TableSpec::new(settings::TABLE)
        .column(ColumnSpec::new(settings::KEY, ColumnType::Varchar(100)).not_null().unique())
        .column(ColumnSpec::new(settings::VALUE, ColumnType::Text).not_null())
        .column(ColumnSpec::new(settings::UPDATED_MS, ColumnType::Long).not_null())
}

/// All table specs in creation order (foreign-key parents first).
pub fn all_tables() -> Vec<TableSpec> {
    vec![
        users_table(),
        servers_table(),
        user_server_table(),
        sessions_table(),
        tps_table(),
        ping_table(),
        settings_table(),
    ]
}
