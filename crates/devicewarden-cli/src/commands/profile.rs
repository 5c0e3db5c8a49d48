use anyhow::Result;

use devicewarden_core::profile::{DeviceProfile, DeviceProfileClassifier, ProfileClassification};

use super::StateInputs;

pub fn render(profile: &DeviceProfile, classification: &ProfileClassification) -> String {
    let mut lines = vec![
        format!("Device: {profile}"),
        format!("Profile: {}", classification.label()),
        format!("Automatic filtering: {}", classification.is_exempt()),
    ];
    if classification.dangerous_keys.is_empty() {
        lines.push("Dangerous settings: none".to_string());
    } else {
        let keys: Vec<&str> = classification.dangerous_keys.iter().map(String::as_str).collect();
        lines.push(format!("Dangerous settings: {}", keys.join(", ")));
    }
    for combination in &classification.unsafe_combinations {
        let keys: Vec<&str> = combination.iter().map(String::as_str).collect();
        lines.push(format!("Unsafe together: {}", keys.join(" + ")));
    }
    lines.join("\n")
}

pub fn execute(inputs: &StateInputs, manufacturer: Option<String>, model: Option<String>) -> Result<()> {
    let config = inputs.load_config()?;
    let mut profile = config.device_profile();
    if let Some(manufacturer) = manufacturer {
        profile.manufacturer = manufacturer;
    }
    if let Some(model) = model {
        profile.model = model;
    }
    let classification = DeviceProfileClassifier::with_rules(&config.profiles).classify(&profile);
    println!("{}", render(&profile, &classification));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_g24() {
        let profile = DeviceProfile::new("motorola", "moto g24");
        let classification = DeviceProfileClassifier::builtin().classify(&profile);
        let text = render(&profile, &classification);
        assert!(text.contains("Profile: moto-g24"));
        assert!(text.contains("Automatic filtering: true"));
        assert!(text.contains("forceLocationOn + preventLocationToggle"));
    }

    #[test]
    fn test_render_generic() {
        let profile = DeviceProfile::new("google", "pixel 8");
        let classification = DeviceProfileClassifier::builtin().classify(&profile);
        let text = render(&profile, &classification);
        assert!(text.contains("Profile: generic"));
        assert!(text.contains("Dangerous settings: none"));
    }
}
