//! derp map handling.
//!
//! the active derp map is process-wide, atomically swappable state. it is
//! loaded from a json file when configured, otherwise a single built-in
//! fallback region keeps clients relayable.

use std::path::Path;

use tracing::{info, warn};

use ironscale_proto::{DerpMap, DerpNode, DerpRegion};
use ironscale_types::DerpConfig;

/// the built-in single-region derp map.
pub fn builtin_derp_map(config: &DerpConfig) -> DerpMap {
    let region_id = config.fallback_region_id;
    let region = DerpRegion {
        region_id,
        region_code: "fallback".to_string(),
        region_name: "Fallback".to_string(),
        nodes: vec![DerpNode {
            name: format!("{region_id}a"),
            region_id,
            host_name: config.fallback_region_host.clone(),
            ..Default::default()
        }],
    };

    DerpMap {
        regions: [(region_id, region)].into_iter().collect(),
    }
}

/// load the derp map from the configured file, or fall back.
pub fn load_derp_map(config: &DerpConfig) -> DerpMap {
    let Some(path) = &config.derp_map_path else {
        return builtin_derp_map(config);
    };

    match read_derp_map(path) {
        Ok(map) if !map.regions.is_empty() => {
            info!(path = %path.display(), regions = map.regions.len(), "loaded derp map");
            map
        }
        Ok(_) => {
            warn!(path = %path.display(), "derp map file has no regions, using fallback");
            builtin_derp_map(config)
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "failed to load derp map, using fallback");
            builtin_derp_map(config)
        }
    }
}

fn read_derp_map(path: &Path) -> Result<DerpMap, Box<dyn std::error::Error>> {
    let data = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}
