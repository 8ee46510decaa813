pub const SYSTEM_PROMPT: &str = "You are an expert front-end engineer who reproduces user interfaces \
from screenshots and screen recordings as clean, responsive HTML, CSS and JavaScript. \
Match layout, spacing, colours, typography and copy as closely as possible. \
Use Tailwind utility classes where convenient; it is loaded from its CDN.";

pub const IMAGE_GENERATION_PROMPT: &str = "Recreate the user interface shown in this image as a single \
complete HTML document. Put custom CSS in one <style> block in the <head> and any JavaScript needed \
for interactive elements in one <script> block at the end of the <body>. Reply with the full document \
inside one ```html code block.";

pub const VIDEO_BASELINE_PROMPT: &str = "This is the first frame of a screen recording of a user \
interface. Describe the initial state of the UI in detail: overall layout, components, colours, \
typography, text content and anything that looks interactive. Do not write code yet.";

pub const VIDEO_SUMMARY_PROMPT: &str = "Summarize every interaction you observed across all frames: \
which element was used, what the user did, and how the interface responded (state changes, \
animations, navigation, content updates). List them in the order they happened.";

pub fn video_frame_prompt(index: usize, timestamp: f64, total: usize) -> String {
    format!(
        "This is frame {} of {} at {:.1}s. Compared with the previous frame, what changed in the \
         interface, and what user interaction most likely caused that change? If nothing changed, \
         say so briefly.",
        index + 1,
        total,
        timestamp
    )
}

pub fn video_implementation_prompt(summary: &str) -> String {
    format!(
        "Now implement the complete user interface from the recording as a single HTML document. \
         Reproduce the initial visual state exactly and implement every interaction from this \
         summary with JavaScript:\n\n{summary}\n\n\
         Put custom CSS in one <style> block in the <head> and the JavaScript in one <script> \
         block at the end of the <body>. Reply with the full document inside one ```html code block."
    )
}

pub fn refinement_prompt(current_document: &str, iteration: u32, max_iterations: u32) -> String {
    format!(
        "Refinement pass {iteration} of {max_iterations}. Compare the HTML below against the \
         attached design. Start your reply with a line `MATCH: YES` if the HTML already reproduces \
         the design closely, or `MATCH: NO` otherwise. With MATCH: NO, list the visual and \
         behavioural differences, then provide the complete improved document inside one ```html \
         code block (CSS in a <style> block, JavaScript in a <script> block).\n\n\
         ```html\n{current_document}\n```"
    )
}
