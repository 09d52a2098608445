use std::borrow::Cow;

use heck::{ToKebabCase, ToLowerCamelCase, ToSnakeCase, ToUpperCamelCase};

/// Text transform named in a mapping's TRANSFORM column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    Upper,
    Lower,
    Trim,
    SnakeCase,
    CamelCase,
    PascalCase,
    KebabCase,
}

impl Transform {
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        match normalized.as_str() {
            "UPPER" | "UPPERCASE" => Some(Transform::Upper),
            "LOWER" | "LOWERCASE" => Some(Transform::Lower),
            "TRIM" => Some(Transform::Trim),
            "SNAKE" | "SNAKE_CASE" => Some(Transform::SnakeCase),
            "CAMEL" | "CAMEL_CASE" => Some(Transform::CamelCase),
            "PASCAL" | "PASCAL_CASE" => Some(Transform::PascalCase),
            "KEBAB" | "KEBAB_CASE" => Some(Transform::KebabCase),
            _ => None,
        }
    }

    pub fn apply<'a>(&self, value: &'a str) -> Cow<'a, str> {
        match self {
            Transform::Upper if value.chars().any(char::is_lowercase) => {
                Cow::Owned(value.to_uppercase())
            }
            Transform::Lower if value.chars().any(char::is_uppercase) => {
                Cow::Owned(value.to_lowercase())
            }
            Transform::Upper | Transform::Lower => Cow::Borrowed(value),
            Transform::Trim => Cow::Borrowed(value.trim()),
            Transform::SnakeCase => Cow::Owned(value.to_snake_case()),
            Transform::CamelCase => Cow::Owned(value.to_lower_camel_case()),
            Transform::PascalCase => Cow::Owned(value.to_upper_camel_case()),
            Transform::KebabCase => Cow::Owned(value.to_kebab_case()),
        }
    }
}
