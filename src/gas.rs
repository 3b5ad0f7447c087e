//! Gas mixture signal model.
//!
//! The simulated ion signal at a given mass/electron-energy working point is
//! the sum of contributions from every catalogued species close enough in
//! mass to the query. Each contribution is the species' partial pressure
//! scaled by an electron-impact ionization efficiency curve and a Gaussian
//! peak shape centred on the species mass.
//!
//! The model is deterministic; detector noise is added by the acquisition
//! engine, not here.

use tracing::error;

/// Half-width of the mass window a species can contribute inside.
///
/// Tuned so adjacent integer peaks stay resolved: a species exactly one mass
/// unit away never leaks into the neighbouring peak.
pub const MASS_WINDOW: f64 = 0.75;

/// Gaussian peak sigma. Clear between unit-spaced peaks to ~1%.
pub const PEAK_SIGMA: f64 = 0.25;

/// One chemical species in the mixture.
#[derive(Debug, Clone)]
pub struct GasSpecies {
    name: String,
    mass: f64,
    ionization_threshold: f64,
    partial_pressure: f64,
}

impl GasSpecies {
    fn new(name: &str, mass: f64, ionization_threshold: f64) -> Self {
        Self {
            name: name.to_string(),
            mass,
            ionization_threshold,
            partial_pressure: 0.0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mass(&self) -> f64 {
        self.mass
    }

    pub fn ionization_threshold(&self) -> f64 {
        self.ionization_threshold
    }

    pub fn partial_pressure(&self) -> f64 {
        self.partial_pressure
    }

    /// Electron-impact ionization efficiency at the given electron energy.
    ///
    /// Zero below the species threshold; above it the yield rises with the
    /// energy surplus and rolls off as `energy^1.2`.
    pub fn ionization_efficiency(&self, electron_energy: f64) -> f64 {
        if electron_energy < self.ionization_threshold {
            return 0.0;
        }
        let over_threshold = electron_energy - self.ionization_threshold;
        3.0 * over_threshold / electron_energy.powf(1.2)
    }

    /// This species' contribution to the signal at the query working point.
    pub fn signal(&self, mass: f64, electron_energy: f64) -> f64 {
        if self.partial_pressure == 0.0 {
            return 0.0;
        }
        let normalized = (mass - self.mass) / PEAK_SIGMA;
        let gaussian = (-normalized.powi(2) / 2.0).exp();
        self.partial_pressure * self.ionization_efficiency(electron_energy) * gaussian
    }
}

/// The gas mixture inside the simulated vacuum chamber.
///
/// Species are kept sorted by mass (stable on ties) so signal queries can
/// restrict themselves to a bounded window, and the aggregate total pressure
/// is always recomputed as an exact sum over all species.
#[derive(Debug, Clone)]
pub struct GasMixture {
    species: Vec<GasSpecies>,
    total_pressure: f64,
}

impl GasMixture {
    /// Build the fixed species catalogue.
    ///
    /// Ionization thresholds from the NIST WebBook / standard ionization
    /// energy tables.
    pub fn standard() -> Self {
        let mut mixture = Self {
            species: Vec::new(),
            total_pressure: 0.0,
        };

        mixture.insert(GasSpecies::new("H", 1.0, 13.59844));
        mixture.insert(GasSpecies::new("He", 4.0, 24.58738));
        mixture.insert(GasSpecies::new("N", 14.0, 14.53414));
        mixture.insert(GasSpecies::new("O", 16.0, 13.61806));
        mixture.insert(GasSpecies::new("A", 18.0, 15.75962));
        mixture.insert(GasSpecies::new("F", 19.0, 17.42282));

        mixture.insert(GasSpecies::new("H2", 2.0, 15.425927));
        mixture.insert(GasSpecies::new("D2", 4.0, 15.46658));
        mixture.insert(GasSpecies::new("H2O", 18.0, 12.6223));
        mixture.insert(GasSpecies::new("N2", 28.0, 15.581));
        mixture.insert(GasSpecies::new("CO", 28.0, 14.0142));
        mixture.insert(GasSpecies::new("O2", 32.0, 12.0697));
        mixture.insert(GasSpecies::new("F2", 38.0, 15.697));
        mixture.insert(GasSpecies::new("CO2", 44.0, 13.778));

        mixture
    }

    /// Insert keeping the list sorted by mass, after any existing species of
    /// equal mass (stable tie order).
    fn insert(&mut self, species: GasSpecies) {
        let index = self.species.partition_point(|s| s.mass <= species.mass);
        self.species.insert(index, species);
    }

    pub fn species(&self) -> &[GasSpecies] {
        &self.species
    }

    /// Look a species up by name.
    pub fn gas(&self, name: &str) -> Option<&GasSpecies> {
        self.species.iter().find(|s| s.name == name)
    }

    /// Total pressure as the exact sum of all partial pressures.
    pub fn total_pressure(&self) -> f64 {
        self.total_pressure
    }

    /// Update a species' partial pressure and recompute the total.
    ///
    /// Unknown names are logged and ignored; the mutator never fails across
    /// the interface. Returns whether the species was found.
    pub fn set_pressure(&mut self, name: &str, pressure: f64) -> bool {
        let Some(species) = self.species.iter_mut().find(|s| s.name == name) else {
            error!(gas = name, "ignoring pressure update for unknown species");
            return false;
        };
        species.partial_pressure = pressure;
        // Full sum, never an incremental update that could drift.
        self.total_pressure = self.species.iter().map(|s| s.partial_pressure).sum();
        true
    }

    /// Summed ion signal at the query working point.
    ///
    /// Only species within [`MASS_WINDOW`] of the query mass contribute; the
    /// sorted order lets us slice that window out directly.
    pub fn signal(&self, mass: f64, electron_energy: f64) -> f64 {
        let lo = self
            .species
            .partition_point(|s| s.mass < mass - MASS_WINDOW);
        let hi = self
            .species
            .partition_point(|s| s.mass <= mass + MASS_WINDOW);
        self.species[lo..hi]
            .iter()
            .map(|s| s.signal(mass, electron_energy))
            .sum()
    }
}
