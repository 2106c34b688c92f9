//! Built-in prompt texts.

/// Asks a vision model for a detailed, neutral description of the image.
pub const CAPTION_PROMPT: &str = r#"Describe this image in detail.

Cover, in this order:
1. The characters: how many there are, apparent gender, hair, eyes, clothing and accessories.
2. Pose, expression and what each character is doing.
3. The setting, background and lighting.
4. The art style (anime illustration, photograph, 3D render, sketch, ...).

Write plain prose in English. Be factual and specific; do not speculate about
anything that is not visible. Do not repeat yourself."#;

/// Asks for a content rating on a fixed scale, answered as `[[N]]`.
pub const MODERATION_PROMPT: &str = r#"Based on the image and your description, rate how explicit the content is on this scale:

0 - completely safe: no suggestive elements
1 - mildly suggestive: revealing clothing, flirtatious poses
2 - suggestive: swimwear or underwear focus, strong sexual undertones
3 - partial nudity without explicit sexual activity
4 - nudity or sexual content
5 - explicit sexual activity

Answer with the number only, wrapped in double square brackets, for example [[1]]."#;

/// Follow-up asking the model to justify its moderation rating.
pub const EXPLANATION_PROMPT: &str = r#"Explain briefly why you chose this rating. Point to the specific visual elements that determined it, in two to four sentences."#;

/// Text-only prompt; the caption is appended by the caller.
pub const AGE_ESTIMATION_PROMPT: &str = r#"You will be given a caption describing an illustration. Estimate the apparent age of every character mentioned in it.

Respond with a single JSON object and nothing else, using this schema:

{
  "characters_detected": <number of characters>,
  "characters": [
    {
      "description": "<short identifying description>",
      "age_range": [<min>, <max>],
      "most_likely_age": <integer>,
      "confidence": "low" | "medium" | "high",
      "reasoning": "<cues from the caption that support the estimate>"
    }
  ]
}

List the main character first. If no characters are described, return
{"characters_detected": 0, "characters": []}."#;
