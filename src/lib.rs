pub mod burn_ext {
    pub mod utils;
}
pub mod checkpoint;
pub mod craft_dataset;
pub mod dataset;
pub mod error;
pub mod image_data;
pub mod metric;
pub mod model {
    pub mod detector;
    pub mod recognizer;
}
pub mod parse_config;
pub mod training;
pub mod utils {
    pub mod label_converter;
    pub mod score_map;
    pub mod vocab;
}
