//! XBee module helpers: the stock Kit configuration, the config diff engine,
//! and the translation of flat name/value I/O requests into the three
//! channels the module actually exposes (bit-addressed outputs, persistent
//! AT settings, serial data).

use std::collections::BTreeMap;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::error::{AppError, err};

/// Nested settings tree: group name -> setting name -> value.
pub type ConfigTree = BTreeMap<String, BTreeMap<String, String>>;

/// AT commands whose values must be rendered as hex strings.
const HEX_VALUE_COMMANDS: [&str; 6] = ["M0", "M1", "IC", "PR", "PD", "DS"];

/// AT commands whose values must be rendered as decimal integer strings.
/// `T*` (pin timeouts) and `Q*` share the rule.
const DECIMAL_VALUE_COMMANDS: [&str; 4] = ["LT", "RP", "IR", "IF"];

static DIO_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^DIO(?P<bit>[0-9]+)").expect("dio pattern compiles"));

/// Configuration applied for the stock Kit experience.
/// Valid IO values include "Disabled", "ADC", "Input", "low", "high", "PWM0".
pub fn stock_config() -> ConfigTree {
    let mut config = ConfigTree::new();
    config.insert(
        "Network".into(),
        BTreeMap::from([
            // Enable device cloud, send transparent data to cloud as data stream
            ("DO".to_string(), "0x15".to_string()),
        ]),
    );
    config.insert(
        "InputOutput".into(),
        BTreeMap::from([
            // --- Sample Rate ---
            ("IR".to_string(), "5000".to_string()),
            // --- Change Detect ---
            (
                "IC".to_string(),
                format!("0x{:X}", 1u32 << 4 | 1 << 8 | 1 << 9 | 1 << 7 | 1 << 6),
            ),
            // --- Accelerometer ---
            ("D2".to_string(), "ADC".to_string()),
            ("D3".to_string(), "ADC".to_string()),
            // --- Potentiometer ---
            ("D1".to_string(), "ADC".to_string()),
            // --- Buzzer ---
            ("D7".to_string(), "high".to_string()),
            ("T7".to_string(), "200".to_string()),
            ("P1".to_string(), "PWM1".to_string()),
            // --- LED gauge ---
            ("P0".to_string(), "PWM0".to_string()),
            // --- Vibration Motor ---
            ("D6".to_string(), "high".to_string()),
            ("T6".to_string(), "200".to_string()),
            // --- Red LED ---
            ("D9".to_string(), "low".to_string()),
            // --- Push Button ---
            ("D4".to_string(), "Input".to_string()),
            // --- Slide Switch ---
            ("D8".to_string(), "Input".to_string()),
            // --- UART ---
            ("P3".to_string(), "DOUT".to_string()),
            ("P4".to_string(), "DIN".to_string()),
        ]),
    );
    config.insert(
        "Serial".into(),
        BTreeMap::from([
            // Use transparent mode
            ("AP".to_string(), "0".to_string()),
        ]),
    );
    config
}

/// Compute the corrective patch that brings `observed` back to `reference`.
///
/// Settings added on the device but absent from the reference are ignored;
/// settings removed or changed relative to the reference come back with the
/// reference value. A group entirely missing from `observed` is reproduced
/// verbatim. Groups with no delta are omitted.
pub fn diff_against(observed: &ConfigTree, reference: &ConfigTree) -> ConfigTree {
    let mut delta = ConfigTree::new();
    for (group, reference_settings) in reference {
        match observed.get(group) {
            Some(observed_settings) => {
                let mut changed = BTreeMap::new();
                for (key, reference_value) in reference_settings {
                    if observed_settings.get(key) != Some(reference_value) {
                        changed.insert(key.clone(), reference_value.clone());
                    }
                }
                if !changed.is_empty() {
                    delta.insert(group.clone(), changed);
                }
            }
            None => {
                delta.insert(group.clone(), reference_settings.clone());
            }
        }
    }
    delta
}

/// Flatten a parsed `query_setting` reply into a [`ConfigTree`]. Non-scalar
/// oddities (and the injected `*-url` style keys) are skipped rather than
/// compared.
pub fn config_tree_from_value(settings: &Value) -> ConfigTree {
    let mut tree = ConfigTree::new();
    let Some(groups) = settings.as_object() else {
        return tree;
    };
    for (group, entries) in groups {
        let Some(entries) = entries.as_object() else {
            continue;
        };
        let mut flat = BTreeMap::new();
        for (key, value) in entries {
            match value {
                Value::String(s) => {
                    flat.insert(key.clone(), s.clone());
                }
                Value::Number(n) => {
                    flat.insert(key.clone(), n.to_string());
                }
                Value::Bool(b) => {
                    flat.insert(key.clone(), b.to_string());
                }
                Value::Null => {
                    flat.insert(key.clone(), String::new());
                }
                _ => {}
            }
        }
        tree.insert(group.clone(), flat);
    }
    tree
}

/// Turn a [`ConfigTree`] into the nested JSON shape `set_setting` expects.
pub fn config_tree_to_value(tree: &ConfigTree) -> Value {
    let mut groups = serde_json::Map::new();
    for (group, settings) in tree {
        let mut entries = serde_json::Map::new();
        for (key, value) in settings {
            entries.insert(key.clone(), Value::String(value.clone()));
        }
        groups.insert(group.clone(), Value::Object(entries));
    }
    Value::Object(groups)
}

/// A settings value as accepted on the wire. Each target field has explicit
/// conversion rules; there is no duck typing past this point.
#[derive(Debug, Clone, PartialEq)]
pub enum SettingValue {
    Integer(i64),
    Decimal(f64),
    Boolean(bool),
    Text(String),
}

impl SettingValue {
    /// Classify a JSON scalar. Arrays, objects and null are not settings
    /// values.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Self::Boolean(*b)),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Some(Self::Integer(i))
                } else {
                    n.as_f64().map(Self::Decimal)
                }
            }
            Value::String(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }

    /// Normalize boolean-ish values: real booleans, 0/1 integers, and the
    /// usual textual spellings plus the pin-level words "high"/"low".
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            Self::Integer(i) => Some(*i != 0),
            Self::Decimal(_) => None,
            Self::Text(s) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "on" | "1" | "high" => Some(true),
                "false" | "f" | "no" | "n" | "off" | "0" | "low" => Some(false),
                _ => None,
            },
        }
    }

    /// Integer conversion for fields that require one. Text must be a plain
    /// decimal integer; anything else fails.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            Self::Decimal(d) => Some(*d as i64),
            Self::Boolean(b) => Some(i64::from(*b)),
            Self::Text(s) => s.trim().parse().ok(),
        }
    }

    /// Pass-through rendering for fields with no conversion rule.
    pub fn render(&self) -> String {
        match self {
            Self::Integer(i) => i.to_string(),
            Self::Decimal(d) => d.to_string(),
            Self::Boolean(b) => b.to_string(),
            Self::Text(s) => s.clone(),
        }
    }
}

/// Bit masks for the module's temporary output command: `enable` marks which
/// pins the command touches, `output` the desired level per touched pin.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OutputMasks {
    pub enable: u32,
    pub output: u32,
}

impl OutputMasks {
    pub fn enable_hex(&self) -> String {
        format!("{:#x}", self.enable)
    }

    pub fn output_hex(&self) -> String {
        format!("{:#x}", self.output)
    }
}

/// The three underlying channels a flat I/O request fans into.
#[derive(Debug, Default, PartialEq)]
pub struct IoCommandSet {
    /// Bit-addressed output command, when any `DIO<n>` name was present.
    pub masks: Option<OutputMasks>,
    /// Persistent AT settings destined for the InputOutput settings group.
    pub settings: BTreeMap<String, String>,
    /// Concatenated serial payload (order of arrival), when any `SERIAL*`
    /// name was present.
    pub serial_payload: Option<String>,
}

/// Translate a flat `{name: value}` request into an [`IoCommandSet`].
///
/// Names may arrive with separators or mixed case; everything
/// non-alphanumeric is stripped and the rest upper-cased before matching.
/// Any name matching none of the three patterns fails the whole request;
/// partial application is never attempted.
pub fn encode_io_commands(request: &serde_json::Map<String, Value>) -> Result<IoCommandSet, AppError> {
    let mut masks: Option<OutputMasks> = None;
    let mut settings = BTreeMap::new();
    let mut serial_chunks: Vec<String> = Vec::new();

    for (raw_name, raw_value) in request {
        let name: String = raw_name
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_uppercase();
        let value = SettingValue::from_json(raw_value)
            .ok_or_else(|| err::validation(format!("value for {raw_name} is not a scalar")))?;

        if let Some(caps) = DIO_PATTERN.captures(&name) {
            let bit: u32 = caps["bit"]
                .parse()
                .map_err(|_| err::validation(format!("bad pin index in {raw_name}")))?;
            if bit > 31 {
                return Err(err::validation(format!("pin index {bit} out of range")));
            }
            let level = value
                .as_bool()
                .ok_or_else(|| err::validation(format!("bad output level for {raw_name}")))?;
            let masks = masks.get_or_insert_with(OutputMasks::default);
            masks.enable |= 1 << bit;
            if level {
                masks.output |= 1 << bit;
            }
        } else if name.len() == 2 {
            // Traditional AT command, used for persistent InputOutput
            // settings (PWM levels, sample rates, ...)
            let rendered = render_at_value(&name, &value)
                .ok_or_else(|| err::validation(format!("bad value for AT command {name}")))?;
            settings.insert(name, rendered);
        } else if name.starts_with("SERIAL") {
            // Sending to distinct serial targets is unsupported; all serial
            // chunks collapse into a single write.
            serial_chunks.push(value.render());
        } else {
            return Err(err::validation(format!("unrecognized command name {raw_name}")));
        }
    }

    Ok(IoCommandSet {
        masks,
        settings,
        serial_payload: if serial_chunks.is_empty() {
            None
        } else {
            Some(serial_chunks.concat())
        },
    })
}

/// Render an AT command value according to the per-command table: some
/// commands require hex strings, some decimal integers, the rest pass
/// through untouched.
fn render_at_value(command: &str, value: &SettingValue) -> Option<String> {
    if HEX_VALUE_COMMANDS.contains(&command) {
        value.as_integer().map(|i| format!("{i:#x}"))
    } else if DECIMAL_VALUE_COMMANDS.contains(&command)
        || command.starts_with('T')
        || command.starts_with('Q')
    {
        value.as_integer().map(|i| i.to_string())
    } else {
        Some(value.render())
    }
}
