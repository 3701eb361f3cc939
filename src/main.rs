// Copyright (c) 2022 Mikael Lund
//
// Permission is hereby granted, free of charge, to any person obtaining a copy
// of this software and associated documentation files (the "Software"), to deal
// in the Software without restriction, including without limitation the rights
// to use, copy, modify, merge, publish, distribute, sublicense, and/or sell
// copies of the Software, and to permit persons to whom the Software is
// furnished to do so, subject to the following conditions:
//
// The above copyright notice and this permission notice shall be included in all
// copies or substantial portions of the Software.
//
// THE SOFTWARE IS PROVIDED "AS IS", WITHOUT WARRANTY OF ANY KIND, EXPRESS OR
// IMPLIED, INCLUDING BUT NOT LIMITED TO THE WARRANTIES OF MERCHANTABILITY,
// FITNESS FOR A PARTICULAR PURPOSE AND NONINFRINGEMENT. IN NO EVENT SHALL THE
// AUTHORS OR COPYRIGHT HOLDERS BE LIABLE FOR ANY CLAIM, DAMAGES OR OTHER
// LIABILITY, WHETHER IN AN ACTION OF CONTRACT, TORT OR OTHERWISE, ARISING FROM,
// OUT OF OR IN CONNECTION WITH THE SOFTWARE OR THE USE OR OTHER DEALINGS IN THE
// SOFTWARE.

use clap::Parser;
use faunus_moves::config::{parse_move_list, parse_processes, parse_save_charge, shared_bool, shared_scalar, Config};
use faunus_moves::energy::{Coulomb, Nonbonded};
use faunus_moves::moves::atomic::{AtomRotate, AtomTranslate};
use faunus_moves::moves::cluster_free::ClusterTranslateNoReject;
use faunus_moves::moves::grandcanonical::{IonSpecies, SaltGrandCanonical};
use faunus_moves::moves::temper::{InProcessChannel, ParallelTempering};
use faunus_moves::moves::titration::TitrationSwap;
use faunus_moves::moves::titration_gc::{CounterIon, GrandCanonicalTitration};
use faunus_moves::moves::volume::{IsobaricVolumeMove, IsochoricVolumeMove};
use faunus_moves::moves::RunnableMove;
use faunus_moves::propagator::Propagator;
use faunus_moves::space::{Cuboid, Group, Particle, Space};
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use nalgebra::Vector3;
use rand::Rng;
use std::collections::HashMap;
use std::error::Error;
use std::fs::File;
use std::io::Write;

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to a JSON configuration file; mutually exclusive with --config-inline.
    #[clap(short, long)]
    config: Option<String>,

    /// Inline JSON configuration document, as an alternative to --config.
    #[clap(long)]
    config_inline: Option<String>,

    /// RNG seed.
    #[clap(long, default_value_t = 42)]
    seed: u64,

    /// Number of Monte Carlo steps to run.
    #[clap(short, long, default_value_t = 100_000)]
    steps: u64,

    /// Box side length (A) of the demo cuboid the run starts from.
    #[clap(long, default_value_t = 50.0)]
    side: f64,

    /// Number of mobile cations in the demo starting configuration.
    #[clap(long, default_value_t = 20)]
    num_cations: usize,

    /// Number of mobile anions in the demo starting configuration.
    #[clap(long, default_value_t = 20)]
    num_anions: usize,

    /// Bjerrum length (A).
    #[clap(short, long, default_value_t = 7.0)]
    bjerrum_length: f64,

    /// Output coordinate file (.xyz or .pqr); skipped if omitted.
    #[clap(short, long)]
    outfile: Option<String>,

    /// Verbosity: -v for info, -vv for debug (overridden by RUST_LOG if set).
    #[clap(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();
}

fn build_demo_space(args: &Args, molecule_ids: &HashMap<String, usize>) -> Space {
    let mut rng = rand::thread_rng();
    let boundary = Cuboid::cubic(args.side);
    let mut particles = Vec::with_capacity(args.num_cations + args.num_anions);
    let random_point = |rng: &mut rand::rngs::ThreadRng, side: f64| {
        Vector3::new(
            side * (rng.gen::<f64>() - 0.5),
            side * (rng.gen::<f64>() - 0.5),
            side * (rng.gen::<f64>() - 0.5),
        )
    };
    let cation_id = *molecule_ids.get("cation").unwrap_or(&0);
    let anion_id = *molecule_ids.get("anion").unwrap_or(&1);
    for _ in 0..args.num_cations {
        particles.push(Particle::new(random_point(&mut rng, args.side), 1.0, cation_id));
    }
    for _ in 0..args.num_anions {
        particles.push(Particle::new(random_point(&mut rng, args.side), -1.0, anion_id));
    }
    let groups = vec![
        Group::new("cation", cation_id, 0..args.num_cations, false),
        Group::new("anion", anion_id, args.num_cations..particles.len(), false),
    ];
    Space::new(particles, groups, boundary)
}

/// Builds every move the demo's atomic-ion scenario can construct from the
/// recognised configuration keys present. Molecular-move kinds
/// (`moltransrot`, `crankshaft`, `pivot`, `reptate`, `gc`,
/// `conformationswap`, cluster variants) need a polymer/conformation
/// library this demo doesn't set up, so they're acknowledged but skipped;
/// `Config::validate` has already rejected anything genuinely unrecognised.
fn build_moves(config: &Config, molecule_ids: &HashMap<String, usize>) -> faunus_moves::Result<Vec<Box<dyn RunnableMove>>> {
    let mut roster: Vec<Box<dyn RunnableMove>> = Vec::new();

    if let Some(section) = config.section("atomtranslate") {
        roster.push(Box::new(AtomTranslate::new(parse_move_list(section, molecule_ids)?)));
    }
    if let Some(section) = config.section("atomrotate") {
        roster.push(Box::new(AtomRotate::new(parse_move_list(section, molecule_ids)?)));
    }
    if let Some(section) = config.section("ctransnr") {
        let skip_energy = shared_bool(section, "skipenergy", false);
        roster.push(Box::new(ClusterTranslateNoReject::new(Vec::new(), skip_energy)));
    }
    if let Some(section) = config.section("isobaric") {
        let dp = shared_scalar(section, "dp", 0.0);
        let pressure = shared_scalar(section, "pressure", 0.0);
        let prob = shared_scalar(section, "prob", 1.0);
        roster.push(Box::new(IsobaricVolumeMove::new(dp, pressure, prob)));
    }
    if let Some(section) = config.section("isochoric") {
        let dp = shared_scalar(section, "dp", 0.0);
        let prob = shared_scalar(section, "prob", 1.0);
        roster.push(Box::new(IsochoricVolumeMove::new(dp, prob)));
    }
    if let Some(section) = config.section("atomgc") {
        let prob = shared_scalar(section, "prob", 1.0);
        let cations = vec![IonSpecies { id: *molecule_ids.get("cation").unwrap_or(&0), charge: 1.0, activity_molar: 0.1 }];
        let anions = vec![IonSpecies { id: *molecule_ids.get("anion").unwrap_or(&1), charge: -1.0, activity_molar: 0.1 }];
        roster.push(Box::new(SaltGrandCanonical::new(0, cations, anions, prob)));
    }
    if let Some(section) = config.section("titrate") {
        let processes = parse_processes(section);
        let save_charge = parse_save_charge(section);
        let prob = shared_scalar(section, "prob", 1.0);
        roster.push(Box::new(TitrationSwap::new(processes, prob, save_charge)));
    }
    if let Some(section) = config.section("gctit") {
        let processes = parse_processes(section);
        let save_charge = parse_save_charge(section);
        let prob = shared_scalar(section, "prob", 1.0);
        let salt = SaltGrandCanonical::new(
            0,
            vec![IonSpecies { id: *molecule_ids.get("cation").unwrap_or(&0), charge: 1.0, activity_molar: 0.1 }],
            vec![IonSpecies { id: *molecule_ids.get("anion").unwrap_or(&1), charge: -1.0, activity_molar: 0.1 }],
            prob,
        );
        let counter_ions = vec![CounterIon { id: *molecule_ids.get("anion").unwrap_or(&1), charge: -1.0, activity_molar: 0.1 }];
        roster.push(Box::new(GrandCanonicalTitration::new(salt, processes, counter_ions, save_charge, prob)?));
    }
    if let Some(section) = config.section("temper") {
        let prob = shared_scalar(section, "prob", 1.0);
        roster.push(Box::new(ParallelTempering::new(0, InProcessChannel::new(), prob)));
    }

    Ok(roster)
}

fn save_coordinates(filename: &str, particles: &[Particle]) -> std::io::Result<()> {
    if filename.ends_with(".pqr") {
        save_pqrfile(filename, particles)
    } else {
        save_xyzfile(filename, particles)
    }
}

fn deduce_atom_name(particle: &Particle) -> &'static str {
    if particle.charge > 0.0 {
        "PP"
    } else if particle.charge < 0.0 {
        "MP"
    } else {
        "NP"
    }
}

fn save_xyzfile(filename: &str, particles: &[Particle]) -> std::io::Result<()> {
    let mut file = File::create(filename)?;
    writeln!(file, "{}\ngenerated by faunus-moves", particles.len())?;
    for particle in particles {
        writeln!(
            file,
            "{} {} {} {}",
            deduce_atom_name(particle),
            particle.position.x,
            particle.position.y,
            particle.position.z
        )?;
    }
    Ok(())
}

fn save_pqrfile(filename: &str, particles: &[Particle]) -> std::io::Result<()> {
    let mut file = File::create(filename)?;
    writeln!(file, "{}\ngenerated by faunus-moves", particles.len())?;
    for (index, particle) in particles.iter().enumerate() {
        writeln!(
            file,
            "{:6}{:5} {:^4}{:1}{:3} {:1}{:4}{:1}   {:8.3}{:8.3}{:8.3}{:6.2}{:6.2}",
            "ATOM",
            index + 1,
            deduce_atom_name(particle),
            "A",
            "ION",
            "A",
            1,
            "0",
            particle.position.x,
            particle.position.y,
            particle.position.z,
            particle.charge,
            particle.radius.max(2.0),
        )?;
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_logging(args.verbose);

    let config = match (&args.config, &args.config_inline) {
        (Some(path), _) => Config::from_file(path)?,
        (None, Some(inline)) => Config::from_json_str(inline)?,
        (None, None) => Config::from_json_str("{}")?,
    };

    let mut molecule_ids = HashMap::new();
    molecule_ids.insert("cation".to_string(), 0usize);
    molecule_ids.insert("anion".to_string(), 1usize);

    let mut space = build_demo_space(&args, &molecule_ids);
    let hamiltonian = Nonbonded::new(Coulomb::new(args.bjerrum_length));
    let roster = build_moves(&config, &molecule_ids)?;

    let mut propagator = Propagator::new(args.seed);
    for mov in roster {
        propagator.push(mov);
    }

    let bar = ProgressBar::new(args.steps);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} ({eta})")
            .unwrap()
            .progress_chars("#>-"),
    );

    let chunk = args.steps.max(1).min(1000);
    let mut remaining = args.steps;
    while remaining > 0 {
        let this_chunk = remaining.min(chunk);
        propagator.run(&mut space, &hamiltonian, this_chunk);
        bar.inc(this_chunk);
        remaining -= this_chunk;
    }
    bar.finish();

    propagator.assert_energy_drift_within_tolerance(&space, &hamiltonian);
    let summary = propagator.summary(&space, &hamiltonian);
    let summary_json = serde_json::to_string_pretty(&summary)?;

    match config.json_output_file() {
        Some(path) => {
            let mut file = File::create(&path)?;
            writeln!(file, "{}", summary_json)?;
            info!("wrote run summary to {}", path);
        }
        None => println!("{}", summary_json),
    }

    if let Some(path) = &args.outfile {
        save_coordinates(path, &space.committed)?;
        info!("wrote final coordinates to {}", path);
    }

    Ok(())
}
