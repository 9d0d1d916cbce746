//! Prompts-related command implementations

use anyhow::{bail, Result};
use reckon_core::prompts::{default_prompts_dir, Prompt, PromptId};

/// List all available prompts and their override status
pub fn cmd_prompts_list() -> Result<()> {
    println!("Available Prompts:\n");

    println!("{:<30} {:>7}  {}", "ID", "VERSION", "OVERRIDE");
    println!("{}", "-".repeat(60));

    for id in PromptId::all() {
        let prompt = Prompt::load(*id)?;
        let override_status = if prompt.is_override {
            "✓ Custom"
        } else {
            "Default"
        };
        println!(
            "{:<30} {:>7}  {}",
            id.as_str(),
            prompt.metadata.version,
            override_status
        );
    }

    println!();
    println!(
        "Override directory: {}",
        default_prompts_dir()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(not available)".to_string())
    );

    println!();
    println!("To customize a prompt, save <id>.md in the override directory.");
    println!("It is picked up on the next enrichment run.");

    Ok(())
}

/// Show the content of a specific prompt
pub fn cmd_prompts_show(prompt_id: &str) -> Result<()> {
    let Some(id) = PromptId::from_name(prompt_id) else {
        let known: Vec<&str> = PromptId::all().iter().map(|id| id.as_str()).collect();
        bail!(
            "Unknown prompt ID: {} (available: {})",
            prompt_id,
            known.join(", ")
        );
    };

    let prompt = Prompt::load(id)?;

    println!("Prompt: {}", prompt.metadata.id);
    println!("Version: {}", prompt.metadata.version);
    println!(
        "Source: {}",
        if prompt.is_override {
            "Override"
        } else {
            "Default"
        }
    );

    println!();
    println!("--- Content ---");
    println!("{}", prompt.content);

    Ok(())
}

/// Show the path where prompt overrides should be placed
pub fn cmd_prompts_path() -> Result<()> {
    match default_prompts_dir() {
        Some(path) => {
            println!("{}", path.display());

            if !path.exists() {
                eprintln!();
                eprintln!("Note: This directory does not exist yet.");
                eprintln!("Create it to start adding custom prompts.");
            }
        }
        None => {
            eprintln!("Could not determine prompts directory.");
            eprintln!("The data directory is not available on this system.");
        }
    }

    Ok(())
}
