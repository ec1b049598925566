//! Paragraph-grouped view of a segmentation result, the shape a highlighting UI renders.

use crate::{Image, Paragraph, SegmentOutput};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ParagraphTokens {
    pub index: usize,
    pub text: String,
    /// Trimmed token texts in provider order.
    pub tokens: Vec<String>,
    /// Images that follow this paragraph.
    pub images: Vec<Image>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct GroupedView {
    pub header_images: Vec<Image>,
    pub paragraphs: Vec<ParagraphTokens>,
    /// Images whose position matches no rendered paragraph.
    pub trailing_images: Vec<Image>,
    /// Tokens left out because they never got a position.
    pub unpositioned: usize,
}

/// Group positioned, non-blank tokens by paragraph (ascending), dropping paragraphs
/// that ended up with no tokens.
pub fn group_by_paragraph(out: &SegmentOutput, images: &[Image]) -> GroupedView {
    let mut by_para: BTreeMap<usize, Vec<String>> = BTreeMap::new();
    let mut unpositioned = 0usize;
    for tok in &out.items {
        if tok.is_blank() {
            continue;
        }
        match (tok.is_positioned(), tok.paragraph_index) {
            (true, Some(pi)) if pi < out.paragraph_positions.len() => {
                by_para
                    .entry(pi)
                    .or_default()
                    .push(tok.text.trim().to_string());
            }
            _ => unpositioned += 1,
        }
    }

    let mut view = GroupedView {
        unpositioned,
        ..Default::default()
    };
    let mut images_by_para: BTreeMap<usize, Vec<Image>> = BTreeMap::new();
    for img in images {
        if img.position < 0 {
            view.header_images.push(img.clone());
        } else {
            images_by_para
                .entry(img.position as usize)
                .or_default()
                .push(img.clone());
        }
    }

    for (pi, tokens) in by_para {
        let p: &Paragraph = &out.paragraph_positions[pi];
        view.paragraphs.push(ParagraphTokens {
            index: pi,
            text: p.text.clone(),
            tokens,
            images: images_by_para.remove(&pi).unwrap_or_default(),
        });
    }
    view.trailing_images = images_by_para.into_values().flatten().collect();
    view
}
