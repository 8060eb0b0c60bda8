use crate::*;
use serde::{Deserialize, Serialize};

// --------------------------------------------------------------------------------
// ### Design library records
// --------------------------------------------------------------------------------

/// Wafer manufacturing process. Lengths are in mm.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WaferProcess {
    pub name: String,
    pub wafer_diameter: float,
    pub edge_exclusion: float,
    pub wafer_process_yield: float,
    pub dicing_distance: float,
    #[serde(default)]
    pub reticle_x: Option<float>,
    #[serde(default)]
    pub reticle_y: Option<float>,
    /// Cost of one processed wafer.
    pub wafer_cost: float,
}

impl WaferProcess {
    pub fn reticle_x(&self) -> float {
        self.reticle_x.unwrap_or(26.0)
    }
    pub fn reticle_y(&self) -> float {
        self.reticle_y.unwrap_or(33.0)
    }
    pub fn usable_diameter(&self) -> float {
        self.wafer_diameter - 2.0 * self.edge_exclusion
    }
}

/// One layer of the manufacturing stack.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Layer {
    pub name: String,
    pub defect_density: float,
    pub critical_area_ratio: float,
    pub clustering_factor: float,
    #[serde(default)]
    pub litho_percent: Option<float>,
    #[serde(default)]
    pub stitching_yield: Option<float>,
}

impl Layer {
    /// Negative binomial defect yield of a die of `area` mm^2.
    pub fn layer_yield(&self, area: float) -> float {
        let defects = self.defect_density * area * self.critical_area_ratio;
        (1.0 + defects / self.clustering_factor).powf(-self.clustering_factor)
    }
    pub fn litho_percent(&self) -> float {
        self.litho_percent.unwrap_or(0.0)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Assembly {
    pub name: String,
    pub materials_cost_per_mm2: float,
    pub picknplace_cost_per_die: float,
    pub bonding_cost_per_die: float,
    pub bonding_yield: float,
    #[serde(default)]
    pub alignment_yield: Option<float>,
    /// Package area over summed die area, used by the approximate cost path.
    #[serde(default)]
    pub package_overhead: Option<float>,
}

impl Assembly {
    pub fn alignment_yield(&self) -> float {
        self.alignment_yield.unwrap_or(1.0)
    }
    pub fn package_overhead(&self) -> float {
        self.package_overhead.unwrap_or(1.3)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TestProcess {
    pub name: String,
    pub cost_per_second: float,
    /// Tester seconds needed per mm^2 of die.
    pub seconds_per_mm2: float,
    #[serde(default)]
    pub defect_coverage: Option<float>,
}

impl TestProcess {
    pub fn defect_coverage(&self) -> float {
        self.defect_coverage.unwrap_or(1.0)
    }
}

/// Die-to-die interface cell.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IoCell {
    pub name: String,
    /// Silicon area per unit of bandwidth (mm^2).
    pub area_per_unit: float,
    /// Power per unit of bandwidth.
    pub energy_per_unit: float,
    #[serde(default)]
    pub reach: Option<float>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TechNode {
    pub name: String,
    /// Die area of one unit of block weight at this node.
    pub area_scale: float,
    pub power_density: float,
    pub wafer: WaferProcess,
    pub layers: Vec<Layer>,
    pub io: IoCell,
}

/// Everything the cost model needs to know about the available technologies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DesignLibrary {
    pub techs: Vec<TechNode>,
    pub assembly: Assembly,
    pub test: TestProcess,
}

fn check_fraction(what: &str, value: float) -> Result<()> {
    if value > 0.0 && value <= 1.0 {
        Ok(())
    } else {
        Err(ChipletError::Config(format!(
            "{what} must lie in (0, 1], got {value}"
        )))
    }
}

fn check_non_negative(what: &str, value: float) -> Result<()> {
    if value >= 0.0 && value.is_finite() {
        Ok(())
    } else {
        Err(ChipletError::Config(format!(
            "{what} must be non-negative, got {value}"
        )))
    }
}

impl DesignLibrary {
    pub fn from_json(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| ChipletError::io(path, e))?;
        let library: DesignLibrary = serde_json::from_str(&text)
            .map_err(|e| ChipletError::parse(path, e.line(), e.to_string()))?;
        library.validate()?;
        info!(target:"internal", "Loaded {} technology nodes from {}", library.techs.len(), path.display());
        Ok(library)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| ChipletError::Config(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.techs.is_empty() {
            return Err(ChipletError::Config("no technology nodes defined".into()));
        }
        let mut seen = Set::new();
        for tech in &self.techs {
            if !seen.insert(tech.name.as_str()) {
                return Err(ChipletError::Config(format!(
                    "duplicate technology node {}",
                    tech.name
                )));
            }
            if tech.layers.is_empty() {
                return Err(ChipletError::Config(format!("{} has no layers", tech.name)));
            }
            check_non_negative("area_scale", tech.area_scale)?;
            check_non_negative("power_density", tech.power_density)?;
            check_fraction("wafer_process_yield", tech.wafer.wafer_process_yield)?;
            check_non_negative("wafer_cost", tech.wafer.wafer_cost)?;
            if tech.wafer.usable_diameter() <= 0.0 {
                return Err(ChipletError::Config(format!(
                    "{}: edge exclusion leaves no usable wafer",
                    tech.wafer.name
                )));
            }
            for layer in &tech.layers {
                check_non_negative("defect_density", layer.defect_density)?;
                if layer.clustering_factor <= 0.0 {
                    return Err(ChipletError::Config(format!(
                        "{}: clustering_factor must be positive",
                        layer.name
                    )));
                }
                if let Some(y) = layer.stitching_yield {
                    check_fraction("stitching_yield", y)?;
                }
            }
            check_non_negative("io area_per_unit", tech.io.area_per_unit)?;
        }
        check_fraction("bonding_yield", self.assembly.bonding_yield)?;
        check_fraction("alignment_yield", self.assembly.alignment_yield())?;
        check_non_negative("materials_cost_per_mm2", self.assembly.materials_cost_per_mm2)?;
        check_fraction("defect_coverage", self.test.defect_coverage())?;
        Ok(())
    }

    pub fn tech_index(&self, name: &str) -> Option<usize> {
        self.techs.iter().position(|t| t.name == name)
    }

    pub fn tech_names(&self) -> Vec<String> {
        self.techs.iter().map(|t| t.name.clone()).collect()
    }

    /// Names of the given library indices; unknown indices map to "".
    pub fn names_of(&self, techs: &[usize]) -> Vec<String> {
        techs
            .iter()
            .map(|&t| self.techs.get(t).map(|node| node.name.clone()).unwrap_or_default())
            .collect()
    }

    /// Resolves technology names to library indices.
    pub fn resolve(&self, names: &[String]) -> Result<Vec<usize>> {
        names
            .iter()
            .map(|n| {
                self.tech_index(n)
                    .ok_or_else(|| ChipletError::Config(format!("unknown technology node {n}")))
            })
            .collect()
    }

    /// Built-in library with representative numbers for common nodes.
    pub fn builtin() -> Self {
        // (name, area_scale, power_density, wafer_cost, defect_density, io area, io energy)
        let table: [(&str, float, float, float, float, float, float); 6] = [
            ("7nm", 1.00, 0.40, 9346.0, 0.0009, 0.0040, 0.020),
            ("10nm", 1.35, 0.34, 5992.0, 0.0008, 0.0045, 0.024),
            ("14nm", 1.90, 0.30, 3984.0, 0.0007, 0.0050, 0.028),
            ("22nm", 2.90, 0.25, 3000.0, 0.0006, 0.0060, 0.034),
            ("28nm", 3.60, 0.22, 2361.0, 0.0005, 0.0065, 0.038),
            ("45nm", 6.20, 0.18, 1785.0, 0.0004, 0.0080, 0.050),
        ];
        let techs = table
            .iter()
            .map(|&(name, area_scale, power_density, wafer_cost, d0, io_area, io_energy)| TechNode {
                name: name.to_string(),
                area_scale,
                power_density,
                wafer: WaferProcess {
                    name: format!("wafer_{name}"),
                    wafer_diameter: 300.0,
                    edge_exclusion: 3.0,
                    wafer_process_yield: 0.98,
                    dicing_distance: 0.1,
                    reticle_x: None,
                    reticle_y: None,
                    wafer_cost,
                },
                layers: vec![
                    Layer {
                        name: format!("{name}_feol"),
                        defect_density: d0,
                        critical_area_ratio: 0.6,
                        clustering_factor: 2.0,
                        litho_percent: Some(0.2),
                        stitching_yield: None,
                    },
                    Layer {
                        name: format!("{name}_beol"),
                        defect_density: d0 * 0.5,
                        critical_area_ratio: 0.4,
                        clustering_factor: 2.0,
                        litho_percent: None,
                        stitching_yield: None,
                    },
                ],
                io: IoCell {
                    name: format!("ucie_{name}"),
                    area_per_unit: io_area,
                    energy_per_unit: io_energy,
                    reach: Some(2.0),
                },
            })
            .collect();
        DesignLibrary {
            techs,
            assembly: Assembly {
                name: "organic_substrate".to_string(),
                materials_cost_per_mm2: 0.005,
                picknplace_cost_per_die: 0.05,
                bonding_cost_per_die: 0.1,
                bonding_yield: 0.99,
                alignment_yield: Some(0.999),
                package_overhead: None,
            },
            test: TestProcess {
                name: "known_good_die".to_string(),
                cost_per_second: 0.01,
                seconds_per_mm2: 0.05,
                defect_coverage: Some(0.99),
            },
        }
    }
}

// --------------------------------------------------------------------------------
// ### Algorithm settings
// --------------------------------------------------------------------------------

/// Knobs of the simulated-annealing floorplanner.
#[derive(Debug, Clone, Builder)]
pub struct SaConfig {
    #[builder(default = 1.0)]
    pub area_penalty_weight: float,
    #[builder(default = 1.0)]
    pub package_penalty_weight: float,
    #[builder(default = 1.0)]
    pub net_penalty_weight: float,
    #[builder(default = 0.2)]
    pub pos_swap_prob: float,
    #[builder(default = 0.2)]
    pub neg_swap_prob: float,
    #[builder(default = 0.2)]
    pub double_swap_prob: float,
    #[builder(default = 0.2)]
    pub resize_prob: float,
    #[builder(default = 0.2)]
    pub expand_prob: float,
    #[builder(default = 0.9)]
    pub min_cooling_rate: float,
    #[builder(default = 0.99)]
    pub max_cooling_rate: float,
    #[builder(default = 1e-10)]
    pub min_temperature: float,
    #[builder(default = 4)]
    pub max_workers: usize,
}

impl Default for SaConfig {
    fn default() -> Self {
        SaConfig::builder().build()
    }
}

/// Settings for the partition search.
#[derive(Debug, Clone, Builder)]
pub struct PartitionConfig {
    /// Allowed imbalance, in percent of an even split.
    #[builder(default = 2.0)]
    pub ub_factor: float,
    /// Hold parts to `ub_factor` while refining; otherwise only the
    /// floorplanner limits part sizes.
    #[builder(default = false)]
    pub balance_constraints: bool,
    #[builder(default = 42)]
    pub seed: u64,
    /// Size of the rayon pool, 0 keeps the global default.
    #[builder(default = 0)]
    pub num_threads: usize,
    #[builder(default = vec![1, 2, 3, 4, 5, 6, 7, 8])]
    pub chiplets_set: Vec<usize>,
    #[builder(default = 3)]
    pub refine_iters: usize,
    /// Fraction of the vertices a single pass may move.
    #[builder(default = 0.5)]
    pub max_moves_ratio: float,
    /// Size the refiner from the graph instead of the two fields above.
    #[builder(default = true)]
    pub auto_size: bool,
    #[builder(default = false)]
    pub boundary_flag: bool,
    /// Weight of the cut-span term in move gains.
    #[builder(default = 0.0)]
    pub connectivity_weight: float,
    /// Score moves with the full cost model instead of slopes.
    #[builder(default = false)]
    pub exact_gain: bool,
    /// Moves with non-positive gain a pass may still take before it ends.
    #[builder(default = 0)]
    pub hill_climb_moves: usize,
    #[builder(default = 2000)]
    pub floorplan_steps: usize,
    #[builder(default = 200)]
    pub floorplan_perturbations: usize,
    #[builder(default = 1.0)]
    pub cooling_acceleration: float,
    /// Clearance kept around every die, in mm.
    #[builder(default = 0.1)]
    pub separation: float,
    #[builder(default = false)]
    pub floorplan_each_pass: bool,
    /// Floorplan every selected move before accepting it.
    #[builder(default = false)]
    pub check_move_feasibility: bool,
    #[builder(default = 1.5)]
    pub zscore_threshold: float,
    #[builder(default = 2.0)]
    pub relative_threshold: float,
    #[builder(default = 3)]
    pub min_candidates: usize,
    #[builder(default = 0.99)]
    pub crossbar_quantile: float,
    #[builder(default = 0.6)]
    pub crossbar_majority: float,
    #[builder(default = 1.0)]
    pub cost_coef: float,
    #[builder(default = 0.0)]
    pub power_coef: float,
    /// Use the bounding-box-free package estimate while refining.
    #[builder(default = true)]
    pub approx_state: bool,
    #[builder(default = SaConfig::default())]
    pub sa: SaConfig,
    /// Shell command of the multilevel partitioner, `{graph}` and `{k}` are substituted.
    pub external_partitioner: Option<String>,
    /// Shell command of the embedding tool, `{hgraph}` and `{k}` are substituted.
    pub external_embedding: Option<String>,
    #[builder(default = "chiplet".to_string())]
    pub output_prefix: String,
}

impl Default for PartitionConfig {
    fn default() -> Self {
        PartitionConfig::builder().build()
    }
}

/// Settings of the genetic searches.
#[derive(Debug, Clone, Builder)]
pub struct GeneticConfig {
    #[builder(default = 50)]
    pub population_size: usize,
    #[builder(default = 50)]
    pub num_generations: usize,
    #[builder(default = 0.2)]
    pub mutation_rate: float,
    #[builder(default = 0.7)]
    pub crossover_rate: float,
    #[builder(default = 2)]
    pub min_partitions: usize,
    #[builder(default = 8)]
    pub max_partitions: usize,
    /// Generations before early stopping is considered.
    #[builder(default = 5)]
    pub gen_threshold: usize,
    #[builder(default = 3)]
    pub tournament_size: usize,
    #[builder(default = 1)]
    pub elite_count: usize,
    #[builder(default = 42)]
    pub seed: u64,
}

impl Default for GeneticConfig {
    fn default() -> Self {
        GeneticConfig::builder().build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_library_is_valid() {
        let lib = DesignLibrary::builtin();
        assert!(lib.validate().is_ok());
        assert_eq!(lib.tech_index("14nm"), Some(2));
        assert!(lib.resolve(&["7nm".to_string(), "3nm".to_string()]).is_err());
    }

    #[test]
    fn test_library_json_round_trip() {
        let lib = DesignLibrary::builtin();
        let path = std::env::temp_dir().join("chiplet_part_library_test.json");
        fs::write(&path, lib.to_json().unwrap()).unwrap();
        let loaded = DesignLibrary::from_json(&path).unwrap();
        assert_eq!(loaded.tech_names(), lib.tech_names());
        for (a, b) in loaded.techs.iter().zip(&lib.techs) {
            assert!((a.area_scale - b.area_scale).abs() < 1e-12);
            assert_eq!(a.layers.len(), b.layers.len());
        }
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn test_validate_rejects_bad_records() {
        let mut lib = DesignLibrary::builtin();
        lib.assembly.bonding_yield = 1.5;
        assert!(matches!(lib.validate(), Err(ChipletError::Config(_))));

        let mut lib = DesignLibrary::builtin();
        let dup = lib.techs[0].clone();
        lib.techs.push(dup);
        assert!(lib.validate().is_err());

        let mut lib = DesignLibrary::builtin();
        lib.techs.clear();
        assert!(lib.validate().is_err());
    }

    #[test]
    fn test_optional_fields_default() {
        let json = r#"{"name":"l","defect_density":0.001,"critical_area_ratio":0.5,"clustering_factor":2.0}"#;
        let layer: Layer = serde_json::from_str(json).unwrap();
        assert_eq!(layer.litho_percent(), 0.0);
        assert!(layer.layer_yield(100.0) < 1.0);
        assert_eq!(layer.layer_yield(0.0), 1.0);
    }

    #[test]
    fn test_builder_defaults() {
        let cfg = PartitionConfig::builder().ub_factor(5.0).build();
        assert_eq!(cfg.ub_factor, 5.0);
        assert_eq!(cfg.refine_iters, 3);
        assert!(cfg.external_partitioner.is_none());
        assert_eq!(cfg.sa.min_cooling_rate, 0.9);
    }
}
