use indexmap::IndexMap;
use log::warn;
use std::collections::HashMap;
use std::str::FromStr;

use crate::config::ProfileConfig;
use crate::error::{MediaError, MediaResult};

/// Output codec of a rendition. The wire/database form is the lowercase name.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Codec {
    #[strum(to_string = "jpeg", serialize = "jpg")]
    Jpeg,
    Webp,
    Avif,
    Png,
}

impl Codec {
    pub fn ext(&self) -> &'static str {
        match self {
            Codec::Jpeg => "jpg",
            Codec::Webp => "webp",
            Codec::Avif => "avif",
            Codec::Png => "png",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Codec::Jpeg => "image/jpeg",
            Codec::Webp => "image/webp",
            Codec::Avif => "image/avif",
            Codec::Png => "image/png",
        }
    }

    pub fn default_quality(&self) -> u8 {
        match self {
            Codec::Jpeg => 82,
            _ => 80,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum Fit {
    Cover,
    Contain,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariantDef {
    pub target_w: u32,
    pub target_h: u32,
    pub fit: Fit,
}

#[derive(Debug, Clone)]
pub struct Profile {
    pub name: String,
    pub key_prefix: String,
    pub keep_original: bool,
    pub max_original_long_edge: u32,
    /// Rendering order. JPEG is always present at the head.
    pub codecs: Vec<Codec>,
    /// Variant definitions in the order the configuration declared them.
    pub variants: IndexMap<String, VariantDef>,
}

impl Profile {
    pub fn from_config(name: &str, cfg: &ProfileConfig) -> MediaResult<Self> {
        let mut codecs = vec![Codec::Jpeg];
        for raw in &cfg.codecs {
            match Codec::from_str(raw) {
                Ok(codec) => {
                    if !codecs.contains(&codec) {
                        codecs.push(codec);
                    }
                }
                // Unknown codec names are dropped, not fatal.
                Err(_) => warn!("profile {name}: ignoring unknown codec '{raw}'"),
            }
        }

        let mut variants = IndexMap::new();
        for (variant_name, vc) in &cfg.variants {
            if vc.w == 0 || vc.h == 0 {
                return Err(MediaError::validation(format!(
                    "profile {name}: variant '{variant_name}' has zero dimension"
                )));
            }
            let fit = Fit::from_str(&vc.fit).map_err(|_| {
                MediaError::validation(format!(
                    "profile {name}: variant '{variant_name}' has unknown fit '{}'",
                    vc.fit
                ))
            })?;
            variants.insert(
                variant_name.clone(),
                VariantDef {
                    target_w: vc.w,
                    target_h: vc.h,
                    fit,
                },
            );
        }

        Ok(Profile {
            name: name.to_string(),
            key_prefix: cfg.prefix.trim_end_matches('/').to_string(),
            keep_original: cfg.keep_original,
            max_original_long_edge: cfg.max_original_long_edge,
            codecs,
            variants,
        })
    }
}

/// Immutable lookup table of named rendition profiles, built once at startup.
#[derive(Debug, Clone, Default)]
pub struct ProfileRegistry {
    profiles: HashMap<String, Profile>,
}

impl ProfileRegistry {
    pub fn from_config(config: &IndexMap<String, ProfileConfig>) -> MediaResult<Self> {
        let mut profiles = HashMap::new();
        for (name, cfg) in config {
            profiles.insert(name.clone(), Profile::from_config(name, cfg)?);
        }
        Ok(Self { profiles })
    }

    pub fn get(&self, name: &str) -> MediaResult<&Profile> {
        self.profiles.get(name).ok_or_else(|| MediaError::ProfileUnknown {
            name: name.to_string(),
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(|s| s.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VariantConfig;

    fn profile_config(codecs: &[&str]) -> ProfileConfig {
        let mut variants = IndexMap::new();
        variants.insert(
            "thumb".to_string(),
            VariantConfig {
                w: 100,
                h: 100,
                fit: "cover".to_string(),
            },
        );
        ProfileConfig {
            prefix: "img/products/".to_string(),
            keep_original: false,
            max_original_long_edge: 2048,
            codecs: codecs.iter().map(|s| s.to_string()).collect(),
            variants,
        }
    }

    #[test]
    fn jpeg_is_always_first() {
        let profile = Profile::from_config("p", &profile_config(&["webp", "jpeg"])).unwrap();
        assert_eq!(profile.codecs, vec![Codec::Jpeg, Codec::Webp]);
    }

    #[test]
    fn unknown_codecs_are_filtered() {
        let profile = Profile::from_config("p", &profile_config(&["webp", "tiff", "bmp"])).unwrap();
        assert_eq!(profile.codecs, vec![Codec::Jpeg, Codec::Webp]);
    }

    #[test]
    fn trailing_slash_is_stripped_from_prefix() {
        let profile = Profile::from_config("p", &profile_config(&[])).unwrap();
        assert_eq!(profile.key_prefix, "img/products");
    }

    #[test]
    fn registry_lookup_fails_for_absent_profile() {
        let registry = ProfileRegistry::default();
        match registry.get("missing") {
            Err(MediaError::ProfileUnknown { name }) => assert_eq!(name, "missing"),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn codec_names_round_trip() {
        assert_eq!(Codec::from_str("jpg").unwrap(), Codec::Jpeg);
        assert_eq!(Codec::from_str("JPEG").unwrap(), Codec::Jpeg);
        assert_eq!(Codec::Jpeg.to_string(), "jpeg");
        assert_eq!(Codec::Jpeg.ext(), "jpg");
        assert_eq!(Codec::Avif.content_type(), "image/avif");
        assert_eq!(Codec::Jpeg.default_quality(), 82);
        assert_eq!(Codec::Png.default_quality(), 80);
    }
}
