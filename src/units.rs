use crate::error::{PipelineError, Result};
use std::fmt;
use std::str::FromStr;

/// Physical quantity a unit measures. Conversions only happen within one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quantity {
    Temperature,
    Length,
    Speed,
    Pressure,
    Time,
    Ratio,
}

/// Units understood by the transformer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unit {
    Celsius,
    Fahrenheit,
    Kelvin,
    Meter,
    Centimeter,
    Millimeter,
    Kilometer,
    Foot,
    Inch,
    MeterPerSecond,
    KilometerPerHour,
    MilePerHour,
    Knot,
    Pascal,
    Hectopascal,
    Kilopascal,
    Millibar,
    Bar,
    Second,
    Minute,
    Hour,
    Unitless,
    Percent,
}

impl Unit {
    /// Physical quantity the unit measures.
    pub fn quantity(self) -> Quantity {
        use Unit::*;
        match self {
            Celsius | Fahrenheit | Kelvin => Quantity::Temperature,
            Meter | Centimeter | Millimeter | Kilometer | Foot | Inch => Quantity::Length,
            MeterPerSecond | KilometerPerHour | MilePerHour | Knot => Quantity::Speed,
            Pascal | Hectopascal | Kilopascal | Millibar | Bar => Quantity::Pressure,
            Second | Minute | Hour => Quantity::Time,
            Unitless | Percent => Quantity::Ratio,
        }
    }

    /// Multiplier to the SI base unit of the quantity. Temperatures are not
    /// scale-only and return `None`.
    fn scale(self) -> Option<f64> {
        use Unit::*;
        let scale = match self {
            Celsius | Fahrenheit | Kelvin => return None,
            Meter => 1.0,
            Centimeter => 0.01,
            Millimeter => 0.001,
            Kilometer => 1000.0,
            Foot => 0.3048,
            Inch => 0.0254,
            MeterPerSecond => 1.0,
            KilometerPerHour => 1000.0 / 3600.0,
            MilePerHour => 0.44704,
            Knot => 1852.0 / 3600.0,
            Pascal => 1.0,
            Hectopascal => 100.0,
            Kilopascal => 1000.0,
            Millibar => 100.0,
            Bar => 100_000.0,
            Second => 1.0,
            Minute => 60.0,
            Hour => 3600.0,
            Unitless => 1.0,
            Percent => 0.01,
        };
        Some(scale)
    }
}

impl FromStr for Unit {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        use Unit::*;
        let unit = match s.trim() {
            "degC" | "C" | "°C" | "deg_C" | "celsius" | "Celsius" => Celsius,
            "degF" | "F" | "°F" | "deg_F" | "fahrenheit" | "Fahrenheit" => Fahrenheit,
            "K" | "degK" | "kelvin" | "Kelvin" => Kelvin,
            "m" | "meter" | "meters" => Meter,
            "cm" => Centimeter,
            "mm" => Millimeter,
            "km" => Kilometer,
            "ft" | "feet" => Foot,
            "in" | "inch" | "inches" => Inch,
            "m/s" | "m s-1" | "m s^-1" => MeterPerSecond,
            "km/h" | "km/hr" | "kph" => KilometerPerHour,
            "mph" | "mi/h" => MilePerHour,
            "knot" | "knots" | "kt" | "kn" => Knot,
            "Pa" => Pascal,
            "hPa" => Hectopascal,
            "kPa" => Kilopascal,
            "mbar" | "mb" => Millibar,
            "bar" => Bar,
            "s" | "sec" | "seconds" => Second,
            "min" | "minutes" => Minute,
            "h" | "hr" | "hours" => Hour,
            "1" | "unitless" | "fraction" => Unitless,
            "%" | "percent" => Percent,
            other => {
                return Err(PipelineError::Transform(format!(
                    "unrecognized units '{other}'"
                )));
            }
        };
        Ok(unit)
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Unit::*;
        let s = match self {
            Celsius => "degC",
            Fahrenheit => "degF",
            Kelvin => "K",
            Meter => "m",
            Centimeter => "cm",
            Millimeter => "mm",
            Kilometer => "km",
            Foot => "ft",
            Inch => "in",
            MeterPerSecond => "m/s",
            KilometerPerHour => "km/h",
            MilePerHour => "mph",
            Knot => "knot",
            Pascal => "Pa",
            Hectopascal => "hPa",
            Kilopascal => "kPa",
            Millibar => "mbar",
            Bar => "bar",
            Second => "s",
            Minute => "min",
            Hour => "h",
            Unitless => "1",
            Percent => "%",
        };
        f.write_str(s)
    }
}

/// A resolved conversion between two compatible units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Conversion {
    Identity,
    Scale(f64),
    Temperature { from: Unit, to: Unit },
}

impl Conversion {
    /// Picks the conversion from `from` to `to`.
    ///
    /// # Arguments
    ///
    /// * `from` - Units of the stored values
    /// * `to` - Units the values should end up in
    ///
    /// # Returns
    ///
    /// `Identity` for equal units, a linear `Scale` within one quantity, or a
    /// `Temperature` offset conversion.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Transform` if the units measure different
    /// quantities.
    pub fn between(from: Unit, to: Unit) -> Result<Self> {
        if from == to {
            return Ok(Conversion::Identity);
        }
        if from.quantity() != to.quantity() {
            return Err(PipelineError::Transform(format!(
                "cannot convert {from} ({:?}) to {to} ({:?})",
                from.quantity(),
                to.quantity()
            )));
        }
        match (from.scale(), to.scale()) {
            (Some(a), Some(b)) => Ok(Conversion::Scale(a / b)),
            _ => Ok(Conversion::Temperature { from, to }),
        }
    }

    /// Converts one value. Each temperature pair has its own formula so no
    /// value takes an intermediate trip through Kelvin.
    pub fn apply(&self, value: f64) -> f64 {
        use Unit::*;
        match *self {
            Conversion::Identity => value,
            Conversion::Scale(factor) => value * factor,
            Conversion::Temperature { from, to } => match (from, to) {
                (Celsius, Kelvin) => value + 273.15,
                (Kelvin, Celsius) => value - 273.15,
                (Celsius, Fahrenheit) => value * 9.0 / 5.0 + 32.0,
                (Fahrenheit, Celsius) => (value - 32.0) * 5.0 / 9.0,
                (Fahrenheit, Kelvin) => (value - 32.0) * 5.0 / 9.0 + 273.15,
                (Kelvin, Fahrenheit) => (value - 273.15) * 9.0 / 5.0 + 32.0,
                _ => value,
            },
        }
    }
}

/// Parses both unit strings and resolves the conversion between them.
pub fn conversion(from: &str, to: &str) -> Result<Conversion> {
    if from.trim() == to.trim() {
        return Ok(Conversion::Identity);
    }
    Conversion::between(from.parse()?, to.parse()?)
}
