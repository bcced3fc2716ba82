use serde::Serialize;

use crate::layout::document::Node;

/// Detection quality of a reconstruction against a reference document.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct DetectionMetrics {
    pub predicted: usize,
    pub truth: usize,
    pub matched: usize,
    pub precision: f32,
    pub recall: f32,
    pub f1: f32,
    /// Mean IoU over matched pairs.
    pub mean_iou: f32,
    /// Median IoU over matched pairs.
    pub median_iou: f32,
}

/// Greedily matches `predicted` to `truth` nodes of the same category,
/// highest IoU first, accepting pairs at or above `iou_threshold`.
///
/// Precision is 1.0 without predictions, recall is 1.0 without truth.
pub fn detection_metrics(
    predicted: &[Node],
    truth: &[Node],
    iou_threshold: f32,
) -> DetectionMetrics {
    let mut pairs: Vec<(f32, usize, usize)> = Vec::new();
    for (p, prediction) in predicted.iter().enumerate() {
        for (t, reference) in truth.iter().enumerate() {
            if prediction.category != reference.category {
                continue;
            }
            let iou = prediction.bbox.iou(&reference.bbox);
            if iou >= iou_threshold && iou > 0.0 {
                pairs.push((iou, p, t));
            }
        }
    }
    pairs.sort_by(|a, b| b.0.total_cmp(&a.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));

    let mut predicted_used = vec![false; predicted.len()];
    let mut truth_used = vec![false; truth.len()];
    let mut ious = Vec::new();
    for (iou, p, t) in pairs {
        if predicted_used[p] || truth_used[t] {
            continue;
        }
        predicted_used[p] = true;
        truth_used[t] = true;
        ious.push(iou);
    }

    let matched = ious.len();
    let ratio = |count: usize| {
        if count == 0 {
            1.0
        } else {
            matched as f32 / count as f32
        }
    };
    let precision = ratio(predicted.len());
    let recall = ratio(truth.len());
    let f1 = if precision + recall > 0.0 {
        2.0 * precision * recall / (precision + recall)
    } else {
        0.0
    };

    ious.sort_by(f32::total_cmp);
    let mean_iou = if ious.is_empty() {
        0.0
    } else {
        ious.iter().sum::<f32>() / ious.len() as f32
    };
    let median_iou = match ious.len() {
        0 => 0.0,
        n if n % 2 == 1 => ious[n / 2],
        n => (ious[n / 2 - 1] + ious[n / 2]) / 2.0,
    };

    DetectionMetrics {
        predicted: predicted.len(),
        truth: truth.len(),
        matched,
        precision,
        recall,
        f1,
        mean_iou,
        median_iou,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::{bbox::Bbox, labels::Category},
        layout::{document::Origin, element::Style},
    };

    fn node(id: &str, category: Category, bbox: Bbox) -> Node {
        Node {
            id: id.into(),
            category,
            bbox,
            style: Style::new(),
            children: Vec::new(),
            parent: None,
            source: None,
            target: None,
            value: String::new(),
            confidence: 1.0,
            origin: Origin::Element(id.into()),
        }
    }

    #[test]
    fn test_greedy_matching() {
        let truth = vec![
            node("t0", Category::Shape, Bbox::from_xywh(0.0, 0.0, 10.0, 10.0)),
            node("t1", Category::Shape, Bbox::from_xywh(20.0, 0.0, 10.0, 10.0)),
            node("t2", Category::Arrow, Bbox::from_xywh(10.0, 4.0, 10.0, 2.0)),
        ];
        let predicted = vec![
            node("p0", Category::Shape, Bbox::from_xywh(0.0, 0.0, 10.0, 10.0)),
            // Right place, wrong category
            node("p1", Category::Icon, Bbox::from_xywh(20.0, 0.0, 10.0, 10.0)),
        ];

        let metrics = detection_metrics(&predicted, &truth, 0.5);
        assert_eq!(metrics.matched, 1);
        assert_eq!(metrics.precision, 0.5);
        assert!((metrics.recall - 1.0 / 3.0).abs() < 1e-6);
        // 2 * 0.5 * 1/3 / (0.5 + 1/3) = 0.4
        assert!((metrics.f1 - 0.4).abs() < 1e-6);
        assert_eq!(metrics.mean_iou, 1.0);
    }

    #[test]
    fn test_each_node_matches_once() {
        let truth = vec![node("t0", Category::Shape, Bbox::from_xywh(0.0, 0.0, 10.0, 10.0))];
        let predicted = vec![
            node("p0", Category::Shape, Bbox::from_xywh(1.0, 0.0, 10.0, 10.0)),
            node("p1", Category::Shape, Bbox::from_xywh(0.0, 0.0, 10.0, 10.0)),
        ];
        let metrics = detection_metrics(&predicted, &truth, 0.5);
        assert_eq!(metrics.matched, 1);
        // The exact prediction wins
        assert_eq!(metrics.mean_iou, 1.0);
        assert_eq!(metrics.median_iou, 1.0);
    }

    #[test]
    fn test_empty_inputs() {
        let metrics = detection_metrics(&[], &[], 0.5);
        assert_eq!(metrics.precision, 1.0);
        assert_eq!(metrics.recall, 1.0);
        assert_eq!(metrics.f1, 1.0);
    }
}
