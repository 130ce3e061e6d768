use burn::tensor::activation::log_softmax;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Knowledge-distillation loss
///
/// KL divergence between the teacher's softmax and the student's softmax,
/// summed over classes and averaged over the batch:
///
/// `sum(p_t * (log p_t - log p_s)) / batch_size`
///
/// # Arguments
/// * `student_logits` - Student output logits [batch_size, num_classes]
/// * `teacher_logits` - Teacher soft labels as logits [batch_size, num_classes]
pub fn distillation_loss<B: Backend>(
    student_logits: Tensor<B, 2>,
    teacher_logits: Tensor<B, 2>,
) -> Tensor<B, 1> {
    let [batch_size, _] = student_logits.dims();

    let teacher_log_probs = log_softmax(teacher_logits, 1);
    let teacher_probs = teacher_log_probs.clone().exp();
    let student_log_probs = log_softmax(student_logits, 1);

    teacher_probs
        .mul(teacher_log_probs.sub(student_log_probs))
        .sum()
        .div_scalar(batch_size.max(1) as f32)
}

/// Supervised loss plus the distillation term when soft labels are given
pub fn compose_loss<B: Backend>(
    supervised: Tensor<B, 1>,
    student_logits: Tensor<B, 2>,
    teacher_logits: Option<Tensor<B, 2>>,
) -> Tensor<B, 1> {
    match teacher_logits {
        Some(teacher) => supervised + distillation_loss(student_logits, teacher),
        None => supervised,
    }
}
