use sea_orm::sea_query::Value;

/// Storage kind of a value column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Double,
    Integer,
    Json,
    Text,
}

impl ColumnKind {
    /// Typed SQL NULL for a column of this kind.
    pub fn null(self) -> Value {
        match self {
            ColumnKind::Double => Value::Double(None),
            ColumnKind::Integer => Value::BigInt(None),
            ColumnKind::Json => Value::Json(None),
            ColumnKind::Text => Value::String(None),
        }
    }
}

/// A nullable value column of a canonical series table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueColumn {
    pub name: &'static str,
    pub kind: ColumnKind,
}

const fn column(name: &'static str, kind: ColumnKind) -> ValueColumn {
    ValueColumn { name, kind }
}

const fn double(name: &'static str) -> ValueColumn {
    column(name, ColumnKind::Double)
}

const fn integer(name: &'static str) -> ValueColumn {
    column(name, ColumnKind::Integer)
}

/// Weather station and inverter readings, shared by the averaged telemetry
/// table and the snapshot-fed `weather` table.
macro_rules! weather_columns {
    ($($extra:expr),* $(,)?) => {
        &[
            double("temperature_c"),
            double("dew_point_c"),
            double("relative_humidity"),
            double("pressure_hpa"),
            double("wind_speed_ms"),
            double("wind_direction_deg"),
            double("precip_mmph"),
            integer("energy_today_wh"),
            integer("pv_feed_in_w"),
            integer("battery_soc_pct"),
            integer("active_power_pcc_w"),
            integer("bat_charge_w"),
            integer("bat_discharge_w"),
            column("sma_json", ColumnKind::Json),
            $($extra),*
        ]
    };
}

/// A canonical table keyed by `ts`, with `created_at`/`updated_at` audit
/// columns alongside its value columns.
#[derive(Debug, PartialEq, Eq)]
pub struct SeriesTable {
    pub name: &'static str,
    pub columns: &'static [ValueColumn],
}

/// Natural key column shared by every canonical table.
pub const KEY_COLUMN: &str = "ts";
pub const CREATED_AT: &str = "created_at";
pub const UPDATED_AT: &str = "updated_at";

pub static DAY_AHEAD_PRICES: SeriesTable = SeriesTable {
    name: "day_ahead_prices",
    columns: &[double("price")],
};

pub static SITE_TELEMETRY: SeriesTable = SeriesTable {
    name: "site_telemetry",
    columns: weather_columns!(),
};

/// Rows merged from site snapshots. `merged_at` and `pushed_at` are the
/// producer's bookkeeping and are stored verbatim.
pub static WEATHER: SeriesTable = SeriesTable {
    name: "weather",
    columns: weather_columns!(
        column("merged_at", ColumnKind::Text),
        column("pushed_at", ColumnKind::Text),
    ),
};

/// Every canonical table, in migration order.
pub static ALL_TABLES: [&SeriesTable; 3] = [&DAY_AHEAD_PRICES, &SITE_TELEMETRY, &WEATHER];

impl SeriesTable {
    /// Looks up a canonical table by name.
    pub fn by_name(name: &str) -> Option<&'static SeriesTable> {
        ALL_TABLES.iter().copied().find(|t| t.name == name)
    }

    pub fn column(&self, name: &str) -> Option<&ValueColumn> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn column_names(&self) -> Vec<&'static str> {
        self.columns.iter().map(|c| c.name).collect()
    }
}
