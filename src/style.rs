use serde::{Deserialize, Serialize};

/// The fixed, ordered style set shared by every picker and by the façade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Style {
    #[default]
    #[serde(rename = "unspecified")] Unspecified,
    #[serde(rename = "photorealistic")] Photorealistic,
    #[serde(rename = "Anime")] Anime,
    #[serde(rename = "cartoon")] Cartoon,
    #[serde(rename = "ink sketch")] InkSketch,
    #[serde(rename = "black & white")] BlackAndWhite,
    #[serde(rename = "color pop")] ColorPop,
    #[serde(rename = "water color")] WaterColor,
    #[serde(rename = "raphaelite oil painting")] RaphaeliteOilPainting,
    #[serde(rename = "dark fantasy")] DarkFantasy,
    #[serde(rename = "game art")] GameArt,
    #[serde(rename = "comic cover")] ComicCover,
    #[serde(rename = "raphaelite-digital-art")] RaphaeliteDigitalArt,
}

impl Style {
    pub const ALL: [Style; 13] = [
        Style::Unspecified,
        Style::Photorealistic,
        Style::Anime,
        Style::Cartoon,
        Style::InkSketch,
        Style::BlackAndWhite,
        Style::ColorPop,
        Style::WaterColor,
        Style::RaphaeliteOilPainting,
        Style::DarkFantasy,
        Style::GameArt,
        Style::ComicCover,
        Style::RaphaeliteDigitalArt,
    ];

    /// Applied automatically by the storyboard and live pipelines; never offered in a picker.
    pub const BATCH: Style = Style::RaphaeliteDigitalArt;

    pub fn tag(self) -> &'static str {
        match self {
            Style::Unspecified => "unspecified",
            Style::Photorealistic => "photorealistic",
            Style::Anime => "Anime",
            Style::Cartoon => "cartoon",
            Style::InkSketch => "ink sketch",
            Style::BlackAndWhite => "black & white",
            Style::ColorPop => "color pop",
            Style::WaterColor => "water color",
            Style::RaphaeliteOilPainting => "raphaelite oil painting",
            Style::DarkFantasy => "dark fantasy",
            Style::GameArt => "game art",
            Style::ComicCover => "comic cover",
            Style::RaphaeliteDigitalArt => "raphaelite-digital-art",
        }
    }

    /// Descriptive phrase appended to prompts. `None` for the unspecified sentinel.
    pub fn phrase(self) -> Option<&'static str> {
        let phrase = match self {
            Style::Unspecified => return None,
            Style::Photorealistic => "photorealistic, natural lighting, high detail, shot on a full-frame camera",
            Style::Anime => "Japanese anime illustration, clean line art, vibrant cel shading",
            Style::Cartoon => "playful cartoon illustration, bold outlines, flat saturated colors",
            Style::InkSketch => "hand-drawn ink sketch, cross-hatching, loose expressive pen strokes on paper",
            Style::BlackAndWhite => "black and white photograph, strong contrast, rich grain",
            Style::ColorPop => "selective color pop, monochrome scene with one vivid accent color",
            Style::WaterColor => "soft watercolor painting, bleeding pigments, textured paper",
            Style::RaphaeliteOilPainting => "Pre-Raphaelite oil painting, luminous jewel tones, meticulous natural detail",
            Style::DarkFantasy => "dark fantasy art, brooding atmosphere, dramatic chiaroscuro",
            Style::GameArt => "video game concept art, stylized environment, cinematic composition",
            Style::ComicCover => "comic book cover art, dynamic pose, halftone shading, bold inks",
            Style::RaphaeliteDigitalArt => "Pre-Raphaelite inspired digital art, luminous colors, painterly detail, dreamlike storytelling",
        };
        Some(phrase)
    }

    /// Choices for creating a root image.
    pub fn creation_picker() -> Vec<Style> {
        Self::ALL.into_iter().filter(|s| *s != Style::BATCH).collect()
    }

    /// Choices for re-applying a style to an existing image. The unspecified
    /// sentinel is left out so lineages never gain an empty filter.
    pub fn restyle_picker() -> Vec<Style> {
        Self::ALL
            .into_iter()
            .filter(|s| *s != Style::BATCH && *s != Style::Unspecified)
            .collect()
    }
}

/// Appends exactly one `. Style: <phrase>.` suffix, or returns the prompt
/// unchanged for `Unspecified`. Callers must not pass an already-suffixed prompt.
pub fn format_prompt(prompt: &str, style: Style) -> String {
    match style.phrase() {
        None => prompt.to_string(),
        Some(phrase) => format!("{}. Style: {}.", prompt, phrase),
    }
}
