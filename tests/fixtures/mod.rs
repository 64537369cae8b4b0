//! Test fixtures for E2E testing against a live recognition service

/// An object expected to be present in the test bucket, with the label the
/// recognition service should pick for it.
#[derive(Debug, Clone)]
pub struct TestImageFixture {
    pub object_key: &'static str,
    pub expected_label: &'static str,
    pub min_confidence: f64,
    pub description: &'static str,
}

/// Bucket the fixtures are uploaded to before the suite runs.
pub const TEST_BUCKET: &str = "photos";

pub const TEST_FIXTURES: &[TestImageFixture] = &[
    TestImageFixture {
        object_key: "car_man.jpg",
        expected_label: "Car",
        min_confidence: 90.0,
        description: "Man standing next to a parked car",
    },
    TestImageFixture {
        object_key: "dog_park.jpg",
        expected_label: "Dog",
        min_confidence: 85.0,
        description: "Dog on grass",
    },
    TestImageFixture {
        object_key: "plain white.png",
        expected_label: "",
        min_confidence: 0.0,
        description: "Blank image; key contains a space; no labels expected",
    },
];

/// Fixtures that should end with a label.
pub fn labeled_fixtures() -> impl Iterator<Item = &'static TestImageFixture> {
    TEST_FIXTURES.iter().filter(|f| !f.expected_label.is_empty())
}
