//! canfix-defs - CAN-FIX datatypes and device definitions
//!
//! Everything needed to turn CAN-FIX payload bytes into values and back,
//! without touching a bus:
//!
//! - **Datatypes** - the wire types (`SHORT`, `UINT`, `FLOAT`, `CHAR` ...) with
//!   multiplier scaling and precision-aware rounding
//! - **Parameter catalog** - names, units and scaling for well known ids
//! - **Device definitions** - per (type, model, version) descriptions of a
//!   node's parameters, firmware update method and configuration keys,
//!   loaded from JSON or YAML files
//! - **Configuration records** - validated, clamped values for configuration
//!   keys, including keys whose meaning depends on another key
//!
//! # Quick Start
//!
//! ```rust
//! use canfix_defs::{DataType, DeviceStore, Value};
//!
//! let store = DeviceStore::from_json(r#"{
//!     "name": "Engine Monitor", "type": "0x30", "model": 1, "version": 1,
//!     "configuration": [{"key": 16, "name": "Fuel Tank Size", "units": "gal",
//!                        "multiplier": 0.1}]
//! }"#).unwrap();
//!
//! let dev = store.find(0x30, 1, 1).unwrap();
//! assert_eq!(dev.name, "Engine Monitor");
//!
//! // 0x0190 = 400 → 40.0 gal
//! let v = DataType::Uint.decode(&[0x90, 0x01], 0.1).unwrap();
//! assert_eq!(v, Value::Float(40.0));
//! ```

pub mod catalog;
pub mod device;
pub mod error;
pub mod precision;
pub mod record;
pub mod store;
pub mod types;

pub use catalog::{lookup as lookup_parameter, meta_name, ParameterSpec};
pub use device::{
    Compare, ConfigControl, ConfigItem, ConfigKind, ConfigVariant, DeviceDefinition, DeviceKey,
    InputKind,
};
pub use error::{parse_int, DefsError, DefsResult};
pub use record::{ConfigRecord, ConfigSet, Rejection};
pub use store::{DeviceStore, LoadReport};
pub use types::{DataType, Value};
