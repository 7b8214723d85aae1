use crate::broker;

/// The delimiter between elements of array-valued properties.
pub const ARRAY_DELIMITER: char = ',';

/// Value types a [`Property`] can carry.
///
/// Integers parse from decimal or prefixed hex/octal/binary; everything
/// formats back through its canonical form.
pub trait PropertyValue: Clone {
    const TYPE_NAME: &'static str;

    fn parse(s: &str) -> Option<Self>;
    fn format(&self) -> String;
}

macro_rules! int_value {
    ($ty:ty) => {
        impl PropertyValue for $ty {
            const TYPE_NAME: &'static str = stringify!($ty);

            fn parse(s: &str) -> Option<Self> {
                parse_int(s).and_then(|v| v.try_into().ok())
            }

            fn format(&self) -> String {
                self.to_string()
            }
        }
    };
}

int_value!(u8);
int_value!(u16);
int_value!(u32);
int_value!(u64);
int_value!(usize);

macro_rules! signed_value {
    ($ty:ty) => {
        impl PropertyValue for $ty {
            const TYPE_NAME: &'static str = stringify!($ty);

            fn parse(s: &str) -> Option<Self> {
                if let Some(rest) = s.strip_prefix('-') {
                    let v: i128 = parse_int(rest)?.try_into().ok()?;
                    (-v).try_into().ok()
                } else {
                    let v: i128 = parse_int(s)?.try_into().ok()?;
                    v.try_into().ok()
                }
            }

            fn format(&self) -> String {
                self.to_string()
            }
        }
    };
}

signed_value!(i32);
signed_value!(i64);

impl PropertyValue for bool {
    const TYPE_NAME: &'static str = "bool";

    fn parse(s: &str) -> Option<Self> {
        match s {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        }
    }

    fn format(&self) -> String {
        self.to_string()
    }
}

impl PropertyValue for String {
    const TYPE_NAME: &'static str = "string";

    fn parse(s: &str) -> Option<Self> {
        Some(s.to_owned())
    }

    fn format(&self) -> String {
        self.clone()
    }
}

/// Parses an unsigned integer with an optional `0x`/`0o`/`0b` prefix.
pub fn parse_int(s: &str) -> Option<u64> {
    let s = s.trim();

    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else if let Some(oct) = s.strip_prefix("0o") {
        u64::from_str_radix(oct, 8).ok()
    } else if let Some(bin) = s.strip_prefix("0b") {
        u64::from_str_radix(bin, 2).ok()
    } else {
        s.parse().ok()
    }
}

/// A configurable attribute of a module.
///
/// Constructed with a default value and immediately offered to the broker
/// chain for initialization. The string image of the value is kept
/// alongside so the session protocol echoes back exactly what configured
/// the property until it is overwritten.
#[derive(Debug, Clone)]
pub struct Property<T> {
    name: String,
    values: Vec<T>,
    text: String,
    default: T,
    inited: bool,
}

impl<T: PropertyValue> Property<T> {
    /// Scalar property with the given full hierarchical name.
    pub fn new(name: impl Into<String>, default: T) -> Self {
        Self::array(name, default, 1)
    }

    /// Array property of `count` elements, each defaulting to `default`.
    pub fn array(name: impl Into<String>, default: T, count: usize) -> Self {
        assert!(count > 0);

        let name = name.into();
        let mut prop = Self {
            text: join(&vec![default.clone(); count]),
            values: vec![default.clone(); count],
            default,
            inited: false,
            name,
        };

        if let Some(value) = broker::init(&prop.name) {
            if prop.set_str(&value).is_ok() {
                prop.inited = true;
            } else {
                log::warn!("invalid initializer '{value}' for property {}", prop.name);
            }
        }

        prop
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Base name: the part after the last hierarchy separator.
    pub fn basename(&self) -> &str {
        match self.name.rfind(broker::HIERARCHY_CHAR) {
            Some(pos) => &self.name[pos + 1..],
            None => &self.name,
        }
    }

    pub fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    pub fn count(&self) -> usize {
        self.values.len()
    }

    /// Whether a broker supplied the current value.
    pub fn is_inited(&self) -> bool {
        self.inited
    }

    pub fn default(&self) -> &T {
        &self.default
    }

    pub fn get(&self) -> &T {
        &self.values[0]
    }

    pub fn get_at(&self, idx: usize) -> &T {
        &self.values[idx]
    }

    pub fn set(&mut self, value: T) {
        self.set_at(0, value);
    }

    pub fn set_at(&mut self, idx: usize, value: T) {
        self.values[idx] = value;
        self.text = join(&self.values);
    }

    /// String image of the value, elements separated by
    /// [`ARRAY_DELIMITER`].
    pub fn str(&self) -> &str {
        &self.text
    }

    /// Parses a string image. Fails without touching the value if any
    /// element does not parse or the element count does not match.
    pub fn set_str(&mut self, s: &str) -> Result<(), String> {
        let parts = split_escaped(s);

        if parts.len() != self.values.len() {
            return Err(format!(
                "property {} needs {} initializers, {} given",
                self.name,
                self.values.len(),
                parts.len()
            ));
        }

        let mut values = Vec::with_capacity(parts.len());

        for part in &parts {
            match T::parse(part) {
                Some(v) => values.push(v),
                None => return Err(format!("cannot parse '{part}' as {}", T::TYPE_NAME)),
            }
        }

        self.values = values;
        self.text = s.to_owned();
        Ok(())
    }
}

fn join<T: PropertyValue>(values: &[T]) -> String {
    let escaped: Vec<String> = values
        .iter()
        .map(|v| v.format().replace(ARRAY_DELIMITER, "\\,"))
        .collect();

    escaped.join(&ARRAY_DELIMITER.to_string())
}

/// Splits on the array delimiter, honoring backslash escapes.
fn split_escaped(s: &str) -> Vec<String> {
    let mut parts = vec![String::new()];
    let mut chars = s.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(next) = chars.next() {
                    parts.last_mut().unwrap().push(next);
                }
            }
            ARRAY_DELIMITER => parts.push(String::new()),
            _ => parts.last_mut().unwrap().push(c),
        }
    }

    parts
}
