// Copyright 2024 The Virtlink Authors. All rights reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//    http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::fmt;
use std::marker::PhantomData;

use serde::{Deserialize, Deserializer, de};

/// Helper for serde macro that accepts a data size either as a plain byte
/// count or as a string with a binary unit suffix ("512", "10M", "4k").
/// Shellexpand variables are resolved before the suffix is parsed.
pub fn convert_data_size_with_shellexpand<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    struct DataSizeVisitor(PhantomData<u64>);

    impl de::Visitor<'_> for DataSizeVisitor {
        type Value = u64;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a byte count or a string like \"10M\"")
        }

        fn visit_i64<E: de::Error>(self, v: i64) -> Result<Self::Value, E> {
            v.try_into().map_err(de::Error::custom)
        }

        fn visit_u64<E: de::Error>(self, v: u64) -> Result<Self::Value, E> {
            Ok(v)
        }

        fn visit_str<E: de::Error>(self, v: &str) -> Result<Self::Value, E> {
            let expanded = shellexpand::env(v).map_err(de::Error::custom)?;
            parse_data_size(&expanded).map_err(de::Error::custom)
        }
    }

    deserializer.deserialize_any(DataSizeVisitor(PhantomData))
}

/// Parses "512", "10M", "1g" and friends into a byte count.
pub fn parse_data_size(value: &str) -> Result<u64, String> {
    let value = value.trim();
    if value.is_empty() {
        return Err("empty data size".to_string());
    }
    let (number, multiplier) = match value.as_bytes()[value.len() - 1].to_ascii_uppercase() {
        b'K' => (&value[..value.len() - 1], 1024u64),
        b'M' => (&value[..value.len() - 1], 1024u64 * 1024),
        b'G' => (&value[..value.len() - 1], 1024u64 * 1024 * 1024),
        b'T' => (&value[..value.len() - 1], 1024u64 * 1024 * 1024 * 1024),
        _ => (value, 1u64),
    };
    let number = number
        .trim()
        .parse::<u64>()
        .map_err(|e| format!("invalid data size '{value}': {e}"))?;
    number
        .checked_mul(multiplier)
        .ok_or_else(|| format!("data size '{value}' overflows u64"))
}

/// Helper for serde macro so you can use shellexpand variables in string
/// configuration fields.
pub fn convert_string_with_shellexpand<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<String, D::Error> {
    let value = String::deserialize(deserializer)?;
    Ok((*(shellexpand::env(&value).map_err(de::Error::custom)?)).to_string())
}
