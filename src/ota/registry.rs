// Entity class registry: which runtime sources each entity class needs on the device

use std::str::FromStr;

/// Resource package holding all device-side sources
pub const MICRO_PACKAGE: &str = "mqtt_house.micro";

/// A (package, device-relative filename) pair in the resource store.
pub type ResourceFile = (&'static str, &'static str);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityClass {
    SinglePinSimpleLight,
    ThreePinRgbLight,
    OneWireDs18x20Temperature,
    PicoInkyDisplay,
    HBridgeMomentarySwitch,
    SinglePinBinarySensor,
    Bme280Temperature,
    Bme280Pressure,
    Bme280Humidity,
}

const LIGHT: &[ResourceFile] = &[(MICRO_PACKAGE, "mqtt_house/entity/light.py")];
const ONEWIRE_TEMPERATURE: &[ResourceFile] = &[
    (MICRO_PACKAGE, "mqtt_house/entity/temperature.py"),
    (MICRO_PACKAGE, "onewire.py"),
    (MICRO_PACKAGE, "ds18x20.py"),
];
const DISPLAY: &[ResourceFile] = &[(MICRO_PACKAGE, "mqtt_house/entity/display.py")];
const SWITCH: &[ResourceFile] = &[(MICRO_PACKAGE, "mqtt_house/entity/switch.py")];
const BINARY_SENSOR: &[ResourceFile] = &[(MICRO_PACKAGE, "mqtt_house/entity/binary_sensor.py")];
const BME280_TEMPERATURE: &[ResourceFile] = &[
    (MICRO_PACKAGE, "mqtt_house/entity/temperature.py"),
    (MICRO_PACKAGE, "mqtt_house/sensors.py"),
    (MICRO_PACKAGE, "bme280_float.py"),
];
const BME280_PRESSURE: &[ResourceFile] = &[
    (MICRO_PACKAGE, "mqtt_house/entity/pressure.py"),
    (MICRO_PACKAGE, "mqtt_house/sensors.py"),
    (MICRO_PACKAGE, "bme280_float.py"),
];
const BME280_HUMIDITY: &[ResourceFile] = &[
    (MICRO_PACKAGE, "mqtt_house/entity/humidity.py"),
    (MICRO_PACKAGE, "mqtt_house/sensors.py"),
    (MICRO_PACKAGE, "bme280_float.py"),
];

impl EntityClass {
    pub const ALL: [EntityClass; 9] = [
        EntityClass::SinglePinSimpleLight,
        EntityClass::ThreePinRgbLight,
        EntityClass::OneWireDs18x20Temperature,
        EntityClass::PicoInkyDisplay,
        EntityClass::HBridgeMomentarySwitch,
        EntityClass::SinglePinBinarySensor,
        EntityClass::Bme280Temperature,
        EntityClass::Bme280Pressure,
        EntityClass::Bme280Humidity,
    ];

    /// Fully qualified class name as used in the `cls` field of an entity.
    pub fn class_name(&self) -> &'static str {
        match self {
            EntityClass::SinglePinSimpleLight => "mqtt_house.entity.light.SinglePinSimpleLight",
            EntityClass::ThreePinRgbLight => "mqtt_house.entity.light.ThreePinRGBLight",
            EntityClass::OneWireDs18x20Temperature => {
                "mqtt_house.entity.temperature.OneWireDS18x20Temperature"
            }
            EntityClass::PicoInkyDisplay => "mqtt_house.entity.display.PicoInkyDisplay",
            EntityClass::HBridgeMomentarySwitch => "mqtt_house.entity.switch.HBridgeMomentarySwitch",
            EntityClass::SinglePinBinarySensor => {
                "mqtt_house.entity.binary_sensor.SinglePinBinarySensor"
            }
            EntityClass::Bme280Temperature => "mqtt_house.entity.temperature.BME280Temperature",
            EntityClass::Bme280Pressure => "mqtt_house.entity.pressure.BME280Pressure",
            EntityClass::Bme280Humidity => "mqtt_house.entity.humidity.BME280Humidity",
        }
    }

    /// Sources this class needs, in upload order.
    pub fn files(&self) -> &'static [ResourceFile] {
        match self {
            EntityClass::SinglePinSimpleLight | EntityClass::ThreePinRgbLight => LIGHT,
            EntityClass::OneWireDs18x20Temperature => ONEWIRE_TEMPERATURE,
            EntityClass::PicoInkyDisplay => DISPLAY,
            EntityClass::HBridgeMomentarySwitch => SWITCH,
            EntityClass::SinglePinBinarySensor => BINARY_SENSOR,
            EntityClass::Bme280Temperature => BME280_TEMPERATURE,
            EntityClass::Bme280Pressure => BME280_PRESSURE,
            EntityClass::Bme280Humidity => BME280_HUMIDITY,
        }
    }

    /// Registry lookup by class name; `None` for classes not in the registry.
    pub fn lookup(class_name: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|class| class.class_name() == class_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown entity class '{0}'")]
pub struct UnknownEntityClass(pub String);

impl FromStr for EntityClass {
    type Err = UnknownEntityClass;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::lookup(s).ok_or_else(|| UnknownEntityClass(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_lookup_round_trips_every_class() {
        for class in EntityClass::ALL {
            assert_eq!(class.class_name().parse::<EntityClass>(), Ok(class));
        }
    }

    #[test]
    fn test_unknown_class() {
        assert!(EntityClass::lookup("mqtt_house.entity.experimental.Thing").is_none());
        assert!("".parse::<EntityClass>().is_err());
    }

    #[test]
    fn test_file_lists_have_no_internal_duplicates() {
        for class in EntityClass::ALL {
            let files = class.files();
            let unique: HashSet<_> = files.iter().map(|(_, name)| name).collect();
            assert_eq!(unique.len(), files.len(), "{:?}", class);
        }
    }
}
