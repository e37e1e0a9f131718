//! Command implementations. Structured errors map to exit code 1 in
//! `main`; stdout carries JSON payloads only.

use crate::{
    chunk_config, embedder_for, engine_for, packet_name, paths_for, print_stdout, registry_base,
    BuildEmbedArgs, BuildRunArgs, BuildVerifyArgs, Cli, LookupArgs, QueryArgs,
};
use anyhow::{bail, Context as AnyhowContext, Result};
use cpm_builder::{ArchiveFormat, BuildConfig, Clock, SystemClock};
use cpm_lockfile::{artifact_hashes_from_dir, frozen_violations, plan_mismatches};
use cpm_oci::OciRef;
use cpm_retrieval::MAX_QUERY_K;

pub(crate) async fn build_run(cli: &Cli, args: &BuildRunArgs) -> Result<()> {
    let embedder = embedder_for(cli)?;
    let name = packet_name(args.name.as_ref(), &args.dest)?;
    let chunk = chunk_config(args.chunk_tokens, args.overlap_tokens);
    let plan = crate::compute_plan(
        &args.source,
        &name,
        &args.packet_version,
        &args.profile,
        &chunk,
        &embedder,
        args.dim,
    )?;
    let lock_path = args.dest.join(&args.lockfile_name);

    // Frozen determinism is checked before anything touches disk.
    if args.frozen_lockfile {
        if let Ok(existing) = cpm_lockfile::load(&lock_path) {
            let violations = frozen_violations(&existing);
            if !violations.is_empty() {
                bail!(
                    "frozen-lockfile violation:\n  {}",
                    violations.join("\n  ")
                );
            }
        }
    }

    // Plan drift aborts unless the caller asked for a lockfile update.
    if !args.update_lock {
        if let Ok(existing) = cpm_lockfile::load(&lock_path) {
            let mismatches = plan_mismatches(&existing, &plan);
            if !mismatches.is_empty() {
                bail!(
                    "lockfile plan mismatch (rerun with --update-lock to accept):\n  {}",
                    mismatches.join("\n  ")
                );
            }
        }
    }

    let config = BuildConfig {
        name: Some(name),
        version: args.packet_version.clone(),
        build_profile: args.profile.clone(),
        chunk,
        expected_dim: args.dim,
        archive: args.archive.then_some(ArchiveFormat::TarGz),
        ..Default::default()
    };
    let clock = SystemClock;
    let manifest = cpm_builder::build(&args.source, &args.dest, &config, &embedder, &clock)
        .await
        .context("build failed")?;

    // A successful build always refreshes artifact hashes in the lockfile.
    let artifacts = artifact_hashes_from_dir(&args.dest)?;
    let lockfile = cpm_lockfile::render(
        &plan,
        artifacts,
        clock.now_rfc3339(),
        env!("CARGO_PKG_VERSION"),
        Vec::new(),
    );
    cpm_lockfile::write(&lockfile, &lock_path)?;

    print_stdout(&serde_json::to_string(&manifest)?)?;
    Ok(())
}

pub(crate) async fn build_embed(cli: &Cli, args: &BuildEmbedArgs) -> Result<()> {
    let embedder = embedder_for(cli)?;
    let name = packet_name(args.name.as_ref(), &args.dest)?;
    let config = BuildConfig {
        name: Some(name),
        version: args.packet_version.clone(),
        expected_dim: args.dim,
        ..Default::default()
    };
    let manifest =
        cpm_builder::embed_from_existing_chunks(&args.dest, &config, &embedder, &SystemClock)
            .await
            .context("embed failed")?;
    print_stdout(&serde_json::to_string(&manifest)?)?;
    Ok(())
}

pub(crate) async fn build_verify(cli: &Cli, args: &BuildVerifyArgs) -> Result<()> {
    let embedder = embedder_for(cli)?;
    let name = packet_name(args.name.as_ref(), &args.dest)?;
    let chunk = chunk_config(args.chunk_tokens, args.overlap_tokens);
    let plan = crate::compute_plan(
        &args.source,
        &name,
        &args.packet_version,
        &args.profile,
        &chunk,
        &embedder,
        args.dim,
    )?;

    let lock_path = args.dest.join(&args.lockfile_name);
    let lockfile = cpm_lockfile::load(&lock_path)
        .with_context(|| format!("no lockfile at {}", lock_path.display()))?;
    let report = cpm_lockfile::verify(&lockfile, &plan, &args.dest, args.frozen)?;

    print_stdout(&report.summary())?;
    if !report.all_passed() {
        bail!("lockfile verification failed");
    }
    Ok(())
}

pub(crate) async fn lookup(cli: &Cli, args: &LookupArgs) -> Result<()> {
    let raw = match (&args.reference, &args.name) {
        (Some(reference), _) => reference.clone(),
        (None, Some(name)) => {
            let tag = args
                .packet_version
                .clone()
                .unwrap_or_else(|| args.alias.clone());
            format!("{name}:{tag}")
        }
        (None, None) => bail!("either --ref or --name is required"),
    };
    let base = registry_base(cli);
    let reference = OciRef::normalize(&raw, base.as_deref())?;

    let paths = paths_for(cli);
    let policy = cpm_oci::OciPolicy::default();
    let resolver = cpm_oci::SourceResolver::new(
        paths,
        cpm_oci::Registry::Http(cpm_oci::HttpRegistry::new(
            cpm_oci::OciClientConfig::default(),
            policy.clone(),
        )?),
        policy,
    );
    let lookup = resolver.lookup_metadata(&reference).await?;

    print_stdout(&serde_json::to_string(&serde_json::json!({
        "pinned_uri": lookup.pinned_uri,
        "digest": lookup.digest,
        "cache_hit": lookup.cache_hit,
        "packet": lookup.metadata.packet,
    }))?)?;
    Ok(())
}

pub(crate) async fn query(cli: &Cli, args: &QueryArgs) -> Result<()> {
    let base = registry_base(cli);
    let reference = OciRef::normalize(&args.reference, base.as_deref())?;
    let engine = engine_for(cli)?;
    let result = engine
        .query(&reference, &args.query, args.k.clamp(1, MAX_QUERY_K))
        .await?;
    print_stdout(&serde_json::to_string(&result)?)?;
    Ok(())
}
