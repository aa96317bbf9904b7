//! YAML config payloads: parsing user-supplied files, overlaying the settings a
//! controller owns, and rendering the result.

use keel_core::{Error, Result};
use serde_json::Value as Json;

pub fn parse(yaml: &str, what: &str) -> Result<Json> {
    let v: serde_yaml::Value = serde_yaml::from_str(yaml).map_err(|e| Error::malformed(what, e))?;
    let json = serde_json::to_value(v).map_err(|e| Error::malformed(what, e))?;
    match json {
        Json::Object(_) => Ok(json),
        Json::Null => Ok(Json::Object(serde_json::Map::new())),
        _ => Err(Error::malformed(what, "top level must be a mapping")),
    }
}

pub fn render(doc: &Json) -> Result<String> { serde_yaml::to_string(doc).map_err(|e| Error::malformed("rendered config", e)) }

/// Deep-merge `over` into `base`: mappings merge per key, anything else replaces.
pub fn overlay(base: &mut Json, over: &Json) {
    match (base, over) {
        (Json::Object(b), Json::Object(o)) => {
            for (k, ov) in o {
                match b.get_mut(k) {
                    Some(bv) => overlay(bv, ov),
                    None => { b.insert(k.clone(), ov.clone()); }
                }
            }
        }
        (b, o) => *b = o.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_keeps_user_settings() {
        let mut base = parse("server_name: old\nlisteners:\n  - port: 8008\nextra:\n  keep: true\n", "test").unwrap();
        overlay(&mut base, &serde_json::json!({ "server_name": "new", "extra": { "added": 1 } }));
        assert_eq!(base["server_name"], "new");
        assert_eq!(base["listeners"][0]["port"], 8008);
        assert_eq!(base["extra"]["keep"], true);
        assert_eq!(base["extra"]["added"], 1);
        let out = render(&base).unwrap();
        assert_eq!(parse(&out, "again").unwrap(), base);
    }

    #[test]
    fn non_mapping_documents_are_rejected() {
        assert!(matches!(parse("- a\n- b\n", "cfg"), Err(Error::Malformed { .. })));
        assert_eq!(parse("", "cfg").unwrap(), serde_json::json!({}));
    }
}
