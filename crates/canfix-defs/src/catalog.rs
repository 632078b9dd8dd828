//! Built-in CAN-FIX parameter catalog
//!
//! A subset of the published CAN-FIX parameter list: enough to name, type
//! and scale the flight and engine data commonly seen on a network. Ids not
//! listed here are still tracked, with their raw bytes as the value.

use crate::types::DataType;

/// Static description of one CAN-FIX parameter id
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParameterSpec {
    pub id: u16,
    pub name: &'static str,
    pub datatype: DataType,
    pub units: &'static str,
    pub multiplier: f64,
    /// Name of the repeated instance ("Engine", "Cylinder" ...) when the
    /// index distinguishes several copies of the parameter
    pub index_name: Option<&'static str>,
}

const fn entry(
    id: u16,
    name: &'static str,
    datatype: DataType,
    units: &'static str,
    multiplier: f64,
    index_name: Option<&'static str>,
) -> ParameterSpec {
    ParameterSpec {
        id,
        name,
        datatype,
        units,
        multiplier,
        index_name,
    }
}

use DataType::*;

/// Sorted by id
pub static PARAMETERS: &[ParameterSpec] = &[
    entry(0x180, "Pitch Angle", Int, "deg", 0.01, None),
    entry(0x181, "Roll Angle", Int, "deg", 0.01, None),
    entry(0x182, "Angle of Attack", Int, "deg", 0.01, None),
    entry(0x183, "Indicated Airspeed", Uint, "knots", 0.1, None),
    entry(0x184, "Indicated Altitude", Dint, "ft", 1.0, None),
    entry(0x185, "Heading", Uint, "deg", 0.1, None),
    entry(0x186, "Vertical Speed", Int, "ft/min", 1.0, None),
    entry(0x187, "True Airspeed", Uint, "knots", 0.1, None),
    entry(0x190, "Altimeter Setting", Uint, "inHg", 0.01, None),
    entry(0x200, "Engine Speed", Uint, "RPM", 1.0, Some("Engine")),
    entry(0x21E, "Manifold Pressure", Uint, "inHg", 0.01, Some("Engine")),
    entry(0x220, "Oil Pressure", Uint, "psi", 0.01, Some("Engine")),
    entry(0x222, "Oil Temperature", Int, "degC", 0.01, Some("Engine")),
    entry(0x224, "Fuel Pressure", Uint, "psi", 0.01, Some("Engine")),
    entry(0x226, "Fuel Quantity", Uint, "gal", 0.01, Some("Tank")),
    entry(0x228, "Fuel Flow", Uint, "gal/hr", 0.01, Some("Engine")),
    entry(0x500, "Cylinder Head Temperature", Int, "degC", 0.1, Some("Cylinder")),
    entry(0x502, "Exhaust Gas Temperature", Int, "degC", 0.1, Some("Cylinder")),
    entry(0x50E, "Bus Voltage", Uint, "volts", 0.1, Some("Bus")),
    entry(0x512, "Bus Current", Int, "amps", 0.1, Some("Bus")),
    entry(0x580, "Discrete Inputs", Byte, "", 1.0, None),
    entry(0x581, "Discrete Outputs", Word, "", 1.0, None),
    entry(0x587, "Aircraft Identifier", Char, "", 1.0, None),
];

/// Look up a parameter id in the catalog
pub fn lookup(id: u16) -> Option<&'static ParameterSpec> {
    PARAMETERS
        .binary_search_by_key(&id, |p| p.id)
        .ok()
        .map(|i| &PARAMETERS[i])
}

/// Name of a metadata slot carried in the upper nibble of the function code
pub fn meta_name(meta: u8) -> &'static str {
    match meta {
        1 => "Min",
        2 => "Max",
        3 => "Low Warn",
        4 => "Low Alarm",
        5 => "High Warn",
        6 => "High Alarm",
        7 => "Units",
        _ => "Reserved",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_catalog_is_sorted() {
        assert!(PARAMETERS.windows(2).all(|w| w[0].id < w[1].id));
    }

    #[test]
    fn test_lookup() {
        let ias = lookup(0x183).unwrap();
        assert_eq!(ias.name, "Indicated Airspeed");
        assert_eq!(ias.datatype, DataType::Uint);
        assert_eq!(ias.multiplier, 0.1);
        assert_eq!(lookup(0x200).unwrap().index_name, Some("Engine"));
        assert!(lookup(0x101).is_none());
    }

    #[test]
    fn test_meta_name() {
        assert_eq!(meta_name(2), "Max");
        assert_eq!(meta_name(0x0F), "Reserved");
    }
}
