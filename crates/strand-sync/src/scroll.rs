/// Scroll geometry of a pane, in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Viewport {
    pub scroll_top: f64,
    pub client_height: f64,
    pub scroll_height: f64,
}

impl Viewport {
    pub fn new(scroll_top: f64, client_height: f64, scroll_height: f64) -> Self {
        Self {
            scroll_top,
            client_height,
            scroll_height,
        }
    }

    /// Pixels between the bottom of the visible area and the end of content.
    pub fn distance_from_bottom(&self) -> f64 {
        self.scroll_height - self.scroll_top - self.client_height
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScrollPolicy {
    pub threshold: f64,
}

impl Default for ScrollPolicy {
    fn default() -> Self {
        Self { threshold: 100.0 }
    }
}

impl ScrollPolicy {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    /// Feed pane: near enough to the end to fetch the next page.
    pub fn should_load_more(&self, viewport: &Viewport) -> bool {
        viewport.scroll_top + viewport.client_height >= viewport.scroll_height - self.threshold
    }

    /// Chat pane: follow new messages only when already near the bottom,
    /// unless the caller forces it (own send, thread switch).
    pub fn should_autoscroll(&self, viewport: &Viewport, force: bool) -> bool {
        force || viewport.distance_from_bottom() < self.threshold
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_more_at_threshold_boundary() {
        let policy = ScrollPolicy::default();
        // 1000 - 100 = 900; top + height must reach it
        assert!(policy.should_load_more(&Viewport::new(500.0, 400.0, 1000.0)));
        assert!(!policy.should_load_more(&Viewport::new(499.0, 400.0, 1000.0)));
        assert!(policy.should_load_more(&Viewport::new(0.0, 400.0, 300.0)));
    }

    #[test]
    fn test_autoscroll_only_near_bottom_unless_forced() {
        let policy = ScrollPolicy::new(100.0);
        let near = Viewport::new(520.0, 400.0, 1000.0);
        let far = Viewport::new(100.0, 400.0, 1000.0);
        let edge = Viewport::new(500.0, 400.0, 1000.0);
        assert!(policy.should_autoscroll(&near, false));
        assert!(!policy.should_autoscroll(&far, false));
        // exactly at the threshold is not "near"
        assert!(!policy.should_autoscroll(&edge, false));
        assert!(policy.should_autoscroll(&far, true));
    }
}
